//! Address, link and route reconciliation for the tunnel interface via
//! rtnetlink. Reconciliation is apply-style: callers describe the exact set
//! of addresses/routes the interface must bear and everything else on the
//! interface is removed. Kernel-generated entries outside the main routing
//! table (e.g. the local table) are left alone.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope,
};
use rtnetlink::{Error::NetlinkError, Handle, LinkUnspec, RouteMessageBuilder};
use tokio::task::JoinHandle;

use crate::error::NetworkError;

/// An owned rtnetlink connection. The background task driving the socket is
/// aborted when the connection is dropped.
pub struct Netlink {
    handle: Handle,
    task: JoinHandle<()>,
}

impl Drop for Netlink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Netlink {
    /// Opens a netlink connection. Must be called from within a tokio
    /// runtime.
    pub fn new() -> Result<Self, NetworkError> {
        let (connection, handle, _messages) = rtnetlink::new_connection()?;
        let task = tokio::spawn(connection);
        Ok(Netlink { handle, task })
    }

    pub async fn link_index(&self, interface: &str) -> Result<u32, NetworkError> {
        let link = self
            .handle
            .link()
            .get()
            .match_name(interface.to_string())
            .execute()
            .try_next()
            .await
            .map_err(|_| NetworkError::InterfaceNotFound(interface.to_string()))?
            .ok_or_else(|| NetworkError::InterfaceNotFound(interface.to_string()))?;
        Ok(link.header.index)
    }

    pub async fn set_link_up(&self, index: u32) -> Result<(), NetworkError> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await?;
        Ok(())
    }

    /// Ensures the interface bears exactly `desired` addresses; anything
    /// else, including addresses added out-of-band, is removed.
    pub async fn sync_addresses(
        &self,
        index: u32,
        desired: &[IpNet],
    ) -> Result<(), NetworkError> {
        let mut present = Vec::new();
        let mut existing = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(message) = existing.try_next().await? {
            match address_from_message(&message) {
                Some(address) if desired.contains(&address) => present.push(address),
                _ => {
                    if let Err(e) = self.handle.address().del(message).execute().await {
                        if !is_missing(&e) {
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        for address in desired {
            if present.contains(address) {
                continue;
            }
            if let Err(e) = self
                .handle
                .address()
                .add(index, address.addr(), address.prefix_len())
                .execute()
                .await
            {
                if !is_exists(&e) {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Ensures the main table routes exactly `desired` prefixes through the
    /// interface, with link scope.
    pub async fn sync_routes(&self, index: u32, desired: &[IpNet]) -> Result<(), NetworkError> {
        let mut present = Vec::new();
        let routes = self
            .handle
            .route()
            .get(RouteMessageBuilder::<IpAddr>::new().build())
            .execute()
            .try_collect::<Vec<_>>()
            .await?;

        for message in routes {
            if output_interface(&message) != Some(index)
                || message.header.table != libc::RT_TABLE_MAIN
            {
                continue;
            }
            match route_from_message(&message) {
                Some(route) if desired.contains(&route) => present.push(route),
                _ => {
                    if let Err(e) = self.handle.route().del(message).execute().await {
                        if !is_missing(&e) {
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        for route in desired {
            if present.contains(route) {
                continue;
            }
            let message = match route {
                IpNet::V4(net) => RouteMessageBuilder::<Ipv4Addr>::new()
                    .output_interface(index)
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Link)
                    .destination_prefix(net.addr(), net.prefix_len())
                    .build(),
                IpNet::V6(net) => RouteMessageBuilder::<Ipv6Addr>::new()
                    .output_interface(index)
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Link)
                    .destination_prefix(net.addr(), net.prefix_len())
                    .build(),
            };
            if let Err(e) = self.handle.route().add(message).execute().await {
                if !is_exists(&e) {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }
}

fn address_from_message(message: &AddressMessage) -> Option<IpNet> {
    let prefix_len = message.header.prefix_len;
    message.attributes.iter().find_map(|attribute| match attribute {
        AddressAttribute::Address(address) => IpNet::new(*address, prefix_len).ok(),
        _ => None,
    })
}

fn output_interface(message: &RouteMessage) -> Option<u32> {
    message.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

fn route_from_message(message: &RouteMessage) -> Option<IpNet> {
    let prefix_len = message.header.destination_prefix_length;
    message.attributes.iter().find_map(|attribute| match attribute {
        RouteAttribute::Destination(RouteAddress::Inet(address)) => {
            IpNet::new(IpAddr::V4(*address), prefix_len).ok()
        }
        RouteAttribute::Destination(RouteAddress::Inet6(address)) => {
            IpNet::new(IpAddr::V6(*address), prefix_len).ok()
        }
        _ => None,
    })
}

fn is_exists(error: &rtnetlink::Error) -> bool {
    matches!(error, NetlinkError(e) if e.raw_code() == -libc::EEXIST)
}

fn is_missing(error: &rtnetlink::Error) -> bool {
    matches!(
        error,
        NetlinkError(e) if e.raw_code() == -libc::ENOENT || e.raw_code() == -libc::ESRCH
    )
}
