use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use tokio::sync::Mutex;
use wireguard_control::{
    AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

use crate::controller::EndpointChangeEvent;
use crate::error::NetworkError;
use crate::netlink::Netlink;
use crate::peer::{DevicePeer, Peer, PeerConfig, PeerStatus};

/// Authoritative configuration of the local tunnel, derived from the
/// membership roster.
#[derive(Debug, Clone)]
pub struct Config {
    /// Private key, base64-encoded.
    pub private_key: String,
    pub listen_port: u16,
    /// Control-plane address of this machine, a single host from `subnet`.
    pub management_ip: IpAddr,
    /// The subnet assigned to this machine within the cluster network.
    pub subnet: IpNet,
    pub peers: Vec<PeerConfig>,
}

/// The mesh driver. Exclusively owns the kernel tunnel interface, its
/// addresses and its routes; all mutation happens under a single lock shared
/// with the controller tick.
pub struct Network {
    interface: InterfaceName,
    backend: Backend,
    netlink: Netlink,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// `None` until the first configure; the controller refuses to run
    /// before that.
    peers: Option<HashMap<String, Peer>>,
    config: Option<Config>,
}

impl Network {
    pub fn new(interface: InterfaceName, backend: Backend) -> Result<Self, NetworkError> {
        Ok(Network {
            interface,
            backend,
            netlink: Netlink::new()?,
            state: Mutex::new(State::default()),
        })
    }

    pub fn interface(&self) -> &InterfaceName {
        &self.interface
    }

    pub async fn is_configured(&self) -> bool {
        self.state.lock().await.peers.is_some()
    }

    /// Idempotently reconciles the kernel device, interface addresses, link
    /// state and routes towards `config`. A failing step aborts the apply;
    /// partial changes are not rolled back and are picked up by the next
    /// apply. Returns the endpoint changes produced by merging the new
    /// config so the caller can publish them to watchers.
    pub async fn configure(
        &self,
        config: Config,
    ) -> Result<Vec<EndpointChangeEvent>, NetworkError> {
        let mut state = self.state.lock().await;

        let private_key = Key::from_base64(&config.private_key)
            .map_err(|e| NetworkError::Key(e.to_string()))?;

        let device = match Device::get(&self.interface, self.backend) {
            Ok(device) => device,
            Err(e) => {
                log::info!("creating tunnel interface {}: {e}", self.interface);
                DeviceUpdate::new()
                    .set_private_key(private_key.clone())
                    .set_listen_port(config.listen_port)
                    .apply(&self.interface, self.backend)?;
                Device::get(&self.interface, self.backend)?
            }
        };
        let device_peers: HashMap<String, DevicePeer> = device
            .peers
            .iter()
            .map(|info| (info.config.public_key.to_base64(), DevicePeer::from(info)))
            .collect();

        // On the first configure after a daemon restart, seed the in-memory
        // peers from the kernel so handshake state and selected endpoints
        // survive the restart.
        let first_configure = state.peers.is_none();
        let peers = state.peers.get_or_insert_with(HashMap::new);

        let mut events = Vec::new();
        let mut desired_keys = HashSet::new();
        for peer_config in &config.peers {
            desired_keys.insert(peer_config.public_key.clone());
            match peers.get_mut(&peer_config.public_key) {
                Some(peer) => {
                    if let Some(endpoint) = peer.update_config(peer_config.clone()) {
                        events.push(EndpointChangeEvent {
                            public_key: peer_config.public_key.clone(),
                            endpoint,
                        });
                    }
                }
                None => {
                    let mut peer = Peer::new(peer_config.clone());
                    if first_configure {
                        if let Some(device_peer) = device_peers.get(&peer_config.public_key) {
                            peer.update_from_device(device_peer);
                        }
                    }
                    peers.insert(peer_config.public_key.clone(), peer);
                }
            }
        }
        peers.retain(|public_key, _| desired_keys.contains(public_key));

        let wanted: Vec<WantedPeer> = peers.values().map(WantedPeer::from).collect();
        let changes = diff_peers(&device_peers, &wanted);
        let key_changed = device.private_key.as_ref() != Some(&private_key);
        let port_changed = device.listen_port != Some(config.listen_port);
        if !changes.is_empty() || key_changed || port_changed {
            let mut update = DeviceUpdate::new();
            if key_changed {
                update = update.set_private_key(private_key);
            }
            if port_changed {
                update = update.set_listen_port(config.listen_port);
            }
            let builders: Vec<PeerConfigBuilder> = changes
                .iter()
                .map(PeerChange::to_builder)
                .collect::<Result<_, _>>()?;
            update.add_peers(&builders).apply(&self.interface, self.backend)?;
        }

        let index = self.netlink.link_index(&self.interface.to_string()).await?;
        self.netlink
            .sync_addresses(index, &index_addresses(&config))
            .await?;
        self.netlink.set_link_up(index).await?;

        let routes = IpNet::aggregate(
            &peers
                .values()
                .flat_map(|peer| peer.config().allowed_ips.iter().copied())
                .collect::<Vec<_>>(),
        );
        self.netlink.sync_routes(index, &routes).await?;

        state.config = Some(config);
        Ok(events)
    }

    /// One controller tick: reconcile peers with the kernel's observations
    /// and rotate endpoints of unreachable peers. Holds the driver lock for
    /// the duration.
    pub async fn tick(&self) -> Result<Vec<EndpointChangeEvent>, NetworkError> {
        let mut state = self.state.lock().await;
        let peers = state.peers.as_mut().ok_or(NetworkError::NotConfigured)?;

        let device = Device::get(&self.interface, self.backend)?;
        let mut events = Vec::new();
        for info in &device.peers {
            let public_key = info.config.public_key.to_base64();
            if let Some(peer) = peers.get_mut(&public_key) {
                if let Some(endpoint) = peer.update_from_device(&DevicePeer::from(info)) {
                    events.push(EndpointChangeEvent {
                        public_key,
                        endpoint,
                    });
                }
            }
        }

        let mut builders = Vec::new();
        for (public_key, peer) in peers.iter_mut() {
            let Some(endpoint) = peer.should_change_endpoint() else {
                continue;
            };
            let addr = match endpoint.resolve() {
                Ok(addr) => addr,
                Err(e) => {
                    log::warn!("skipping unresolvable endpoint {endpoint} for peer: {e}");
                    continue;
                }
            };
            log::info!("rotating peer {public_key} to endpoint {endpoint}");
            let key = Key::from_base64(public_key)
                .map_err(|e| NetworkError::Key(e.to_string()))?;
            builders.push(PeerConfigBuilder::new(&key).set_endpoint(addr));
            events.push(EndpointChangeEvent {
                public_key: public_key.clone(),
                endpoint,
            });
        }
        if !builders.is_empty() {
            DeviceUpdate::new()
                .add_peers(&builders)
                .apply(&self.interface, self.backend)?;
        }

        Ok(events)
    }

    /// Current liveness of every configured peer, keyed by public key.
    pub async fn peer_statuses(&self) -> Result<Vec<(String, PeerStatus)>, NetworkError> {
        let state = self.state.lock().await;
        let peers = state.peers.as_ref().ok_or(NetworkError::NotConfigured)?;
        Ok(peers
            .iter()
            .map(|(public_key, peer)| (public_key.clone(), peer.status()))
            .collect())
    }

    /// Deletes the kernel tunnel interface, if present.
    pub async fn teardown(&self) -> Result<(), NetworkError> {
        let mut state = self.state.lock().await;
        if let Ok(device) = Device::get(&self.interface, self.backend) {
            device.delete()?;
        }
        state.peers = None;
        state.config = None;
        Ok(())
    }
}

/// The two addresses the interface must bear: the management IP as a host
/// address, and the management IP with the machine subnet's prefix length.
fn index_addresses(config: &Config) -> Vec<IpNet> {
    let host_prefix = match config.management_ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let mut addresses = Vec::with_capacity(2);
    if let Ok(host) = IpNet::new(config.management_ip, host_prefix) {
        addresses.push(host);
    }
    if let Ok(prefixed) = IpNet::new(config.management_ip, config.subnet.prefix_len()) {
        addresses.push(prefixed);
    }
    addresses.dedup();
    addresses
}

/// What the kernel should hold for one peer, derived from the peer state
/// machine (the selected endpoint, not the raw candidate list).
#[derive(Debug, Clone, PartialEq)]
struct WantedPeer {
    public_key: String,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl From<&Peer> for WantedPeer {
    fn from(peer: &Peer) -> Self {
        WantedPeer {
            public_key: peer.public_key().to_string(),
            endpoint: peer
                .selected_endpoint()
                .and_then(|endpoint| endpoint.resolve().ok()),
            allowed_ips: peer.config().allowed_ips.clone(),
            persistent_keepalive: peer.config().persistent_keepalive,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PeerChange {
    Add(WantedPeer),
    Update {
        public_key: String,
        endpoint: Option<SocketAddr>,
        allowed_ips: Option<Vec<IpNet>>,
        persistent_keepalive: Option<u16>,
    },
    Remove(String),
}

impl PeerChange {
    fn to_builder(&self) -> Result<PeerConfigBuilder, NetworkError> {
        let key = |public_key: &str| {
            Key::from_base64(public_key).map_err(|e| NetworkError::Key(e.to_string()))
        };
        Ok(match self {
            PeerChange::Add(wanted) => {
                let mut builder = PeerConfigBuilder::new(&key(&wanted.public_key)?)
                    .replace_allowed_ips()
                    .add_allowed_ips(&to_allowed_ips(&wanted.allowed_ips));
                if let Some(endpoint) = wanted.endpoint {
                    builder = builder.set_endpoint(endpoint);
                }
                if let Some(keepalive) = wanted.persistent_keepalive {
                    builder = builder.set_persistent_keepalive_interval(keepalive);
                }
                builder
            }
            PeerChange::Update {
                public_key,
                endpoint,
                allowed_ips,
                persistent_keepalive,
            } => {
                let mut builder = PeerConfigBuilder::new(&key(public_key)?);
                if let Some(endpoint) = endpoint {
                    builder = builder.set_endpoint(*endpoint);
                }
                if let Some(allowed_ips) = allowed_ips {
                    builder = builder
                        .replace_allowed_ips()
                        .add_allowed_ips(&to_allowed_ips(allowed_ips));
                }
                if let Some(keepalive) = persistent_keepalive {
                    builder = builder.set_persistent_keepalive_interval(*keepalive);
                }
                builder
            }
            PeerChange::Remove(public_key) => PeerConfigBuilder::new(&key(public_key)?).remove(),
        })
    }
}

fn to_allowed_ips(nets: &[IpNet]) -> Vec<AllowedIp> {
    nets.iter()
        .map(|net| AllowedIp {
            address: net.addr(),
            cidr: net.prefix_len(),
        })
        .collect()
}

/// Computes the incremental update taking the kernel's peer set to the
/// wanted one. Peers are never replaced wholesale: unchanged peers are left
/// untouched so their handshake state is preserved.
fn diff_peers(device: &HashMap<String, DevicePeer>, wanted: &[WantedPeer]) -> Vec<PeerChange> {
    let mut changes = Vec::new();
    let mut seen = HashSet::new();

    for want in wanted {
        seen.insert(want.public_key.clone());
        let Some(have) = device.get(&want.public_key) else {
            changes.push(PeerChange::Add(want.clone()));
            continue;
        };

        let endpoint = match (want.endpoint, have.endpoint) {
            (Some(want_ep), have_ep) if Some(want_ep) != have_ep => Some(want_ep),
            _ => None,
        };
        let want_ips: HashSet<IpNet> = want.allowed_ips.iter().copied().collect();
        let have_ips: HashSet<IpNet> = have.allowed_ips.iter().copied().collect();
        let allowed_ips = (want_ips != have_ips).then(|| want.allowed_ips.clone());
        let persistent_keepalive = (want.persistent_keepalive.is_some()
            && want.persistent_keepalive != have.persistent_keepalive)
            .then(|| want.persistent_keepalive.unwrap());

        if endpoint.is_some() || allowed_ips.is_some() || persistent_keepalive.is_some() {
            changes.push(PeerChange::Update {
                public_key: want.public_key.clone(),
                endpoint,
                allowed_ips,
                persistent_keepalive,
            });
        }
    }

    for public_key in device.keys() {
        if !seen.contains(public_key) {
            changes.push(PeerChange::Remove(public_key.clone()));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_peer(public_key: &str, endpoint: Option<&str>, allowed_ips: &[&str]) -> DevicePeer {
        DevicePeer {
            public_key: public_key.to_string(),
            endpoint: endpoint.map(|e| e.parse().unwrap()),
            allowed_ips: allowed_ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            persistent_keepalive: Some(25),
            last_handshake: None,
        }
    }

    fn wanted_peer(public_key: &str, endpoint: Option<&str>, allowed_ips: &[&str]) -> WantedPeer {
        WantedPeer {
            public_key: public_key.to_string(),
            endpoint: endpoint.map(|e| e.parse().unwrap()),
            allowed_ips: allowed_ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            persistent_keepalive: Some(25),
        }
    }

    #[test]
    fn diff_is_empty_for_matching_state() {
        let device = HashMap::from([(
            "a".to_string(),
            device_peer("a", Some("203.0.113.1:51820"), &["10.210.1.0/24", "10.210.1.1/32"]),
        )]);
        let wanted = vec![wanted_peer(
            "a",
            Some("203.0.113.1:51820"),
            // Same set, different order.
            &["10.210.1.1/32", "10.210.1.0/24"],
        )];
        assert!(diff_peers(&device, &wanted).is_empty());
    }

    #[test]
    fn diff_adds_missing_peer() {
        let device = HashMap::new();
        let wanted = vec![wanted_peer("a", Some("203.0.113.1:51820"), &["10.210.1.0/24"])];
        let changes = diff_peers(&device, &wanted);
        assert_eq!(changes, vec![PeerChange::Add(wanted[0].clone())]);
    }

    #[test]
    fn diff_removes_absent_peer() {
        let device = HashMap::from([(
            "stale".to_string(),
            device_peer("stale", None, &["10.210.9.0/24"]),
        )]);
        let changes = diff_peers(&device, &[]);
        assert_eq!(changes, vec![PeerChange::Remove("stale".to_string())]);
    }

    #[test]
    fn diff_updates_only_changed_fields() {
        let device = HashMap::from([(
            "a".to_string(),
            device_peer("a", Some("203.0.113.1:51820"), &["10.210.1.0/24"]),
        )]);
        let wanted = vec![wanted_peer("a", Some("198.51.100.2:51820"), &["10.210.1.0/24"])];
        let changes = diff_peers(&device, &wanted);
        assert_eq!(
            changes,
            vec![PeerChange::Update {
                public_key: "a".to_string(),
                endpoint: Some("198.51.100.2:51820".parse().unwrap()),
                allowed_ips: None,
                persistent_keepalive: None,
            }]
        );
    }

    #[test]
    fn diff_does_not_clear_kernel_endpoint_when_none_is_wanted() {
        // A peer whose candidates are exhausted must keep whatever endpoint
        // the kernel last used rather than being reset.
        let device = HashMap::from([(
            "a".to_string(),
            device_peer("a", Some("203.0.113.1:51820"), &["10.210.1.0/24"]),
        )]);
        let wanted = vec![wanted_peer("a", None, &["10.210.1.0/24"])];
        assert!(diff_peers(&device, &wanted).is_empty());
    }

    #[test]
    fn management_addresses_are_host_and_subnet_prefixed() {
        let config = Config {
            private_key: String::new(),
            listen_port: 51820,
            management_ip: "10.210.0.1".parse().unwrap(),
            subnet: "10.210.0.0/24".parse().unwrap(),
            peers: vec![],
        };
        let addresses = index_addresses(&config);
        assert_eq!(
            addresses,
            vec![
                "10.210.0.1/32".parse::<IpNet>().unwrap(),
                "10.210.0.1/24".parse::<IpNet>().unwrap(),
            ]
        );
    }

    #[test]
    fn route_set_is_compacted() {
        let nets: Vec<IpNet> = vec![
            "10.210.0.0/24".parse().unwrap(),
            "10.210.1.0/24".parse().unwrap(),
            "10.210.1.1/32".parse().unwrap(),
        ];
        let aggregated = IpNet::aggregate(&nets);
        assert_eq!(aggregated, vec!["10.210.0.0/23".parse::<IpNet>().unwrap()]);
    }
}
