//! RPC backends the director dispatches to: the in-process gRPC server via
//! the local socket, and peers reachable at their management IP on the
//! overlay.

use std::{net::Ipv6Addr, path::PathBuf, time::Duration};

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tower::service_fn;

/// Port every machine serves its management API on over the overlay.
pub const MACHINE_API_PORT: u16 = 51000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The in-process endpoint: a lazy channel over the daemon's unix socket,
/// labelled with the machine's canonical address so the director can
/// recognize local-targeted calls and short-circuit network I/O.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    address: String,
    channel: Channel,
}

impl LocalBackend {
    pub fn new(socket_path: PathBuf, address: String) -> Self {
        // The URI is required by tonic but never used: the connector always
        // dials the unix socket. The channel is lazy and reconnects on
        // failure.
        let channel = TonicEndpoint::from_static("http://uncloud")
            .connect_with_connector_lazy(service_fn(move |_: Uri| {
                UnixStream::connect(socket_path.clone())
            }));
        LocalBackend { address, channel }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

/// A peer reachable on the overlay network. Holds one lazily-created
/// multiplexed connection; safe for concurrent use.
#[derive(Clone, Debug)]
pub struct RemoteBackend {
    address: String,
    channel: Channel,
}

impl RemoteBackend {
    pub fn new(address: &str, port: u16) -> Result<Self, tonic::transport::Error> {
        let authority = if address.parse::<Ipv6Addr>().is_ok() {
            format!("[{address}]:{port}")
        } else {
            format!("{address}:{port}")
        };
        let channel = TonicEndpoint::from_shared(format!("http://{authority}"))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();
        Ok(RemoteBackend {
            address: address.to_string(),
            channel,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Terminates the backend. The underlying connection is closed once the
    /// last in-flight call holding a channel clone completes.
    pub fn close(self) {
        log::debug!("closing backend for {}", self.address);
    }
}

#[derive(Clone, Debug)]
pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl Backend {
    pub fn address(&self) -> &str {
        match self {
            Backend::Local(backend) => backend.address(),
            Backend::Remote(backend) => backend.address(),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Backend::Local(backend) => backend.channel(),
            Backend::Remote(backend) => backend.channel(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local(_))
    }
}
