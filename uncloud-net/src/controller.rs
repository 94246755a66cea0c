use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout};

use crate::endpoint::Endpoint;
use crate::error::NetworkError;
use crate::network::Network;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const WATCHER_SEND_TIMEOUT: Duration = Duration::from_secs(1);
const WATCHER_BUFFER: usize = 16;

/// Emitted whenever a peer's selected endpoint changes, by rotation, by a
/// kernel-observed roam, or by a configuration update from membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointChangeEvent {
    pub public_key: String,
    pub endpoint: Endpoint,
}

/// The always-on control loop of the mesh. Ticks once a second under the
/// driver lock, reconciling peer liveness with the kernel and rotating
/// endpoints of unreachable peers; changes are fanned out to registered
/// watcher channels.
pub struct Controller {
    network: Arc<Network>,
    watchers: Mutex<Vec<mpsc::Sender<EndpointChangeEvent>>>,
    running: AtomicBool,
}

impl Controller {
    pub fn new(network: Arc<Network>) -> Self {
        Controller {
            network,
            watchers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Registers a watcher channel. Watchers registered after `run` has
    /// started may miss events published before their registration; that is
    /// fine because watchers resynchronize from authoritative snapshots.
    pub fn watch(&self) -> mpsc::Receiver<EndpointChangeEvent> {
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        self.watchers.lock().push(tx);
        rx
    }

    /// Runs the control loop until the shutdown channel fires. Only one
    /// instance may run at a time, and the network must have been configured
    /// at least once.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), NetworkError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyRunning);
        }
        if !self.network.is_configured().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(NetworkError::NotConfigured);
        }

        let mut ticker = interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    match self.network.tick().await {
                        Ok(events) => {
                            if let Err(e) = self.publish(events).await {
                                log::warn!("publishing endpoint changes: {e}");
                            }
                        }
                        // Kernel errors are not fatal to the loop; the next
                        // tick reconciles.
                        Err(e) => log::warn!("mesh tick failed: {e}"),
                    }
                }
            }
        }

        // Dropping the senders closes every watcher channel.
        self.watchers.lock().clear();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Publishes events to every registered watcher. Each send is bounded by
    /// a timeout; a slow watcher aborts the publish with
    /// `NetworkError::WatcherTimeout` (missed events are acceptable, watchers
    /// resynchronize from snapshots). Watchers whose receiver was dropped are
    /// pruned.
    pub async fn publish(&self, events: Vec<EndpointChangeEvent>) -> Result<(), NetworkError> {
        if events.is_empty() {
            return Ok(());
        }
        let senders: Vec<mpsc::Sender<EndpointChangeEvent>> = self.watchers.lock().clone();
        for event in events {
            for sender in &senders {
                match timeout(WATCHER_SEND_TIMEOUT, sender.send(event.clone())).await {
                    Ok(Ok(())) => {}
                    // Receiver dropped; pruned below.
                    Ok(Err(_)) => {}
                    Err(_) => return Err(NetworkError::WatcherTimeout),
                }
            }
        }
        self.watchers.lock().retain(|sender| !sender.is_closed());
        Ok(())
    }
}
