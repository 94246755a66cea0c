//! The uncloud machine daemon. A machine is one member of a small,
//! leaderless cluster: it keeps an authoritative view of the cluster roster,
//! participates in the WireGuard overlay managed by `uncloud-net`, and
//! serves the Machine and Cluster gRPC APIs. Any machine can accept a call
//! and proxy it to one or many members of the cluster.

pub mod api;
pub mod backend;
pub mod config;
pub mod daemon;
pub mod director;
pub mod proxy;
pub mod publicip;
pub mod store;

pub use backend::{Backend, MACHINE_API_PORT};
pub use daemon::{Daemon, DaemonOptions, TokenInfo};
pub use director::{Director, Route};
pub use store::{ClusterStore, MachineRecord, MembershipState, NetworkConfig};

/// Default cluster overlay network.
pub const DEFAULT_NETWORK: &str = "10.210.0.0/16";
/// Default path of the persisted machine state document.
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/uncloud/machine.toml";
/// Default path of the local API socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/uncloud/machine.sock";
