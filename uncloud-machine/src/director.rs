//! Request classification for the RPC proxy: a call on any machine is served
//! locally, forwarded to one peer, or fanned out to many, driven entirely by
//! the call's incoming metadata.

use std::collections::{hash_map::Entry, HashMap};
use std::path::PathBuf;

use parking_lot::RwLock;
use tonic::{metadata::MetadataMap, Status};

use crate::backend::{Backend, LocalBackend, RemoteBackend};
use crate::proxy::{self, MACHINES_KEY};

#[derive(Clone, Debug)]
pub enum Route {
    One2One(Backend),
    One2Many(Vec<Backend>),
}

struct LocalState {
    address: String,
    backend: LocalBackend,
}

/// Owns the local backend and the cache of remote backends. A remote backend
/// lives for as long as it is cached or in flight on any call, whichever is
/// longer.
pub struct Director {
    socket_path: PathBuf,
    api_port: u16,
    local: RwLock<LocalState>,
    remotes: RwLock<HashMap<String, RemoteBackend>>,
}

impl Director {
    pub fn new(socket_path: PathBuf, api_port: u16) -> Self {
        let backend = LocalBackend::new(socket_path.clone(), String::new());
        Director {
            socket_path,
            api_port,
            local: RwLock::new(LocalState {
                address: String::new(),
                backend,
            }),
            remotes: RwLock::new(HashMap::new()),
        }
    }

    /// The machine's canonical address; empty before the machine has joined
    /// a cluster.
    pub fn local_address(&self) -> String {
        self.local.read().address.clone()
    }

    pub fn local_backend(&self) -> Backend {
        Backend::Local(self.local.read().backend.clone())
    }

    /// Swaps the canonical address and the local backend atomically. Called
    /// during init/join and on reset.
    pub fn update_local_address(&self, address: String) {
        let backend = LocalBackend::new(self.socket_path.clone(), address.clone());
        let mut local = self.local.write();
        local.address = address;
        local.backend = backend;
    }

    /// Classifies a call from its incoming metadata.
    pub fn route(&self, metadata: &MetadataMap) -> Result<Route, Status> {
        // A forwarded call must terminate here regardless of what else the
        // metadata carries.
        if proxy::is_forwarded(metadata) {
            return Ok(Route::One2One(self.local_backend()));
        }
        let Some(addresses) = proxy::machine_addresses(metadata)? else {
            return Ok(Route::One2One(self.local_backend()));
        };
        if addresses.is_empty() {
            return Err(Status::invalid_argument(format!(
                "{MACHINES_KEY} metadata is present but contains no addresses"
            )));
        }

        let mut backends = Vec::with_capacity(addresses.len());
        for address in &addresses {
            backends.push(self.backend_for(address)?);
        }
        if backends.len() == 1 {
            Ok(Route::One2One(backends.remove(0)))
        } else {
            Ok(Route::One2Many(backends))
        }
    }

    fn backend_for(&self, address: &str) -> Result<Backend, Status> {
        {
            let local = self.local.read();
            if !local.address.is_empty() && local.address == address {
                return Ok(Backend::Local(local.backend.clone()));
            }
        }
        if let Some(backend) = self.remotes.read().get(address) {
            return Ok(Backend::Remote(backend.clone()));
        }

        // Created outside the write lock; on a race the later creator closes
        // its backend and adopts the stored one.
        let created = RemoteBackend::new(address, self.api_port)
            .map_err(|e| Status::internal(format!("creating backend for {address}: {e}")))?;
        let mut remotes = self.remotes.write();
        match remotes.entry(address.to_string()) {
            Entry::Occupied(existing) => {
                let adopted = existing.get().clone();
                created.close();
                Ok(Backend::Remote(adopted))
            }
            Entry::Vacant(slot) => {
                slot.insert(created.clone());
                Ok(Backend::Remote(created))
            }
        }
    }

    /// Closes and evicts every cached remote backend. Required after any
    /// topology change that invalidates connection identity, such as a
    /// peer's endpoint rotation.
    pub fn flush_remote_backends(&self) {
        let flushed: Vec<RemoteBackend> = {
            let mut remotes = self.remotes.write();
            remotes.drain().map(|(_, backend)| backend).collect()
        };
        if !flushed.is_empty() {
            log::debug!("flushed {} remote backends", flushed.len());
        }
        for backend in flushed {
            backend.close();
        }
    }

    /// Tears down all backends. Each cached backend is closed exactly once.
    pub fn close(&self) {
        self.flush_remote_backends();
    }

    #[cfg(test)]
    fn cached_remotes(&self) -> usize {
        self.remotes.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    fn director() -> Director {
        let director = Director::new(PathBuf::from("/tmp/uncloud-test.sock"), 51000);
        director.update_local_address("10.210.0.1".to_string());
        director
    }

    fn metadata(machines: &[&str]) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        for machine in machines {
            metadata.append(MACHINES_KEY, MetadataValue::try_from(*machine).unwrap());
        }
        metadata
    }

    #[tokio::test]
    async fn no_metadata_routes_to_local() {
        let director = director();
        match director.route(&MetadataMap::new()).unwrap() {
            Route::One2One(backend) => {
                assert!(backend.is_local());
                assert_eq!(backend.address(), "10.210.0.1");
            }
            _ => panic!("expected One2One"),
        }
    }

    #[tokio::test]
    async fn forwarded_calls_terminate_locally() {
        let director = director();
        let mut md = metadata(&["10.210.1.1", "10.210.2.1"]);
        md.insert(
            proxy::PROXY_AUTHORITY_KEY,
            MetadataValue::from_static("10.210.9.1"),
        );
        match director.route(&md).unwrap() {
            Route::One2One(backend) => assert!(backend.is_local()),
            _ => panic!("expected local One2One"),
        }
    }

    #[tokio::test]
    async fn empty_machines_list_is_invalid() {
        let director = director();
        let md = metadata(&[""]);
        let status = director.route(&md).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn single_address_routes_one2one() {
        let director = director();
        match director.route(&metadata(&["10.210.1.1"])).unwrap() {
            Route::One2One(backend) => {
                assert!(!backend.is_local());
                assert_eq!(backend.address(), "10.210.1.1");
            }
            _ => panic!("expected One2One"),
        }
    }

    #[tokio::test]
    async fn fan_out_preserves_address_order_and_recognizes_local() {
        let director = director();
        let route = director
            .route(&metadata(&["10.210.1.1", "10.210.0.1", "10.210.2.1"]))
            .unwrap();
        match route {
            Route::One2Many(backends) => {
                let addresses: Vec<&str> = backends.iter().map(Backend::address).collect();
                assert_eq!(addresses, vec!["10.210.1.1", "10.210.0.1", "10.210.2.1"]);
                assert!(!backends[0].is_local());
                assert!(backends[1].is_local());
                assert!(!backends[2].is_local());
            }
            _ => panic!("expected One2Many"),
        }
    }

    #[tokio::test]
    async fn remote_backends_are_cached_and_reused() {
        let director = director();
        let first = director.backend_for("10.210.1.1").unwrap();
        let second = director.backend_for("10.210.1.1").unwrap();
        assert_eq!(first.address(), second.address());
        assert_eq!(director.cached_remotes(), 1);
    }

    #[tokio::test]
    async fn flush_evicts_all_cached_backends() {
        let director = director();
        director.backend_for("10.210.1.1").unwrap();
        director.backend_for("10.210.2.1").unwrap();
        assert_eq!(director.cached_remotes(), 2);

        director.flush_remote_backends();
        assert_eq!(director.cached_remotes(), 0);

        // Closing again is a no-op.
        director.close();
        assert_eq!(director.cached_remotes(), 0);
    }

    #[tokio::test]
    async fn update_local_address_changes_routing() {
        let director = director();
        director.update_local_address("10.210.5.1".to_string());
        match director.route(&metadata(&["10.210.5.1"])).unwrap() {
            Route::One2One(backend) => assert!(backend.is_local()),
            _ => panic!("expected local One2One"),
        }
    }
}
