//! gRPC service implementations. Every handler first asks the director how
//! the call should be routed: served locally, forwarded to one peer, or
//! fanned out to many.

mod cluster;
mod machine;

pub use cluster::ClusterService;
pub use machine::MachineService;
