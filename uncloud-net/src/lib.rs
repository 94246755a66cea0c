//! Control plane for the encrypted overlay network joining the machines of
//! an uncloud cluster. The mesh driver owns the kernel WireGuard interface
//! and reconciles it towards the authoritative cluster configuration; the
//! controller keeps probing peer liveness and rotates endpoints for peers
//! that became unreachable.

pub mod controller;
pub mod endpoint;
pub mod error;
pub mod netlink;
pub mod network;
pub mod peer;

pub use controller::{Controller, EndpointChangeEvent};
pub use endpoint::Endpoint;
pub use error::NetworkError;
pub use network::{Config, Network};
pub use peer::{DevicePeer, Peer, PeerConfig, PeerStatus};

/// Name of the cluster tunnel interface on every machine.
pub const INTERFACE_NAME: &str = "uncloud0";
/// Default WireGuard listen port; individual endpoints may override it.
pub const LISTEN_PORT: u16 = 51820;
