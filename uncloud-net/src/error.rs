use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("device error: {0}")]
    Device(#[from] io::Error),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("invalid key: {0}")]
    Key(String),

    #[error("invalid endpoint {0}")]
    Endpoint(String),

    #[error("controller is already running")]
    AlreadyRunning,

    #[error("network has not been configured")]
    NotConfigured,

    #[error("timed out publishing an endpoint change to a watcher")]
    WatcherTimeout,
}
