//! Lifecycle and wiring of one machine: the persisted identity, the
//! membership store, the overlay network, and the gRPC servers, plus the
//! init/join/reset operations that move a machine in and out of a cluster.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::Server;
use tonic::{Request, Status};
use wireguard_control::{Backend as WgBackend, InterfaceName};

use uncloud_net::{Controller, Endpoint, Network};
use uncloud_proto::v1 as pb;
use uncloud_proto::v1::cluster_client::ClusterClient;
use uncloud_proto::v1::cluster_server::ClusterServer;
use uncloud_proto::v1::machine_server::MachineServer;
use uncloud_proto::v1::Metadata;
use uncloud_proto::WithMetadata;

use crate::api::{ClusterService, MachineService};
use crate::backend::MACHINE_API_PORT;
use crate::director::Director;
use crate::proxy::MACHINES_KEY;
use crate::publicip;
use crate::store::{ClusterStore, MachineRecord, MembershipState};
use crate::{DEFAULT_CONFIG_PATH, DEFAULT_NETWORK, DEFAULT_SOCKET_PATH};

/// How often mesh liveness is folded into the membership states.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    pub interface: String,
    pub listen_port: u16,
    pub api_port: u16,
    /// Address the machine advertises for control-plane RPC; defaults to
    /// the management IP.
    pub advertise_address: Option<IpAddr>,
    /// Apply overlay changes to the kernel. Disable in environments without
    /// WireGuard, such as tests.
    pub manage_network: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        DaemonOptions {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            interface: uncloud_net::INTERFACE_NAME.to_string(),
            listen_port: uncloud_net::LISTEN_PORT,
            api_port: MACHINE_API_PORT,
            advertise_address: None,
            manage_network: true,
        }
    }
}

/// A machine token: everything an existing cluster needs to know to admit
/// this machine, handed out-of-band to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub public_key: String,
    pub endpoints: Vec<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<IpAddr>,
}

impl TokenInfo {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> Result<Self, String> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| format!("invalid token encoding: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid token: {e}"))
    }
}

pub struct Daemon {
    options: DaemonOptions,
    store: Arc<ClusterStore>,
    director: Arc<Director>,
    network: Option<Arc<Network>>,
    controller: Option<Arc<Controller>>,
    overlay_started: AtomicBool,
    /// Stops the daemon's servers. Firing it also stops the overlay tasks.
    shutdown: broadcast::Sender<()>,
    /// Stops only the overlay tasks (controller, reconciler, management
    /// listener), so a reset leaves the local socket serving.
    overlay_shutdown: broadcast::Sender<()>,
}

impl Daemon {
    /// Must be called from within a tokio runtime: backends and the netlink
    /// connection spawn background tasks.
    pub fn new(options: DaemonOptions) -> anyhow::Result<Self> {
        let store = Arc::new(ClusterStore::open(&options.config_path)?);
        let director = Arc::new(Director::new(
            options.socket_path.clone(),
            options.api_port,
        ));
        let (network, controller) = if options.manage_network {
            let interface: InterfaceName = options
                .interface
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid interface name {}: {e}", options.interface))?;
            let network = Arc::new(Network::new(interface, WgBackend::Kernel)?);
            let controller = Arc::new(Controller::new(network.clone()));
            (Some(network), Some(controller))
        } else {
            (None, None)
        };
        let (shutdown, _) = broadcast::channel(4);
        let (overlay_shutdown, _) = broadcast::channel(4);
        Ok(Daemon {
            options,
            store,
            director,
            network,
            controller,
            overlay_started: AtomicBool::new(false),
            shutdown,
            overlay_shutdown,
        })
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    pub fn director(&self) -> &Arc<Director> {
        &self.director
    }

    pub fn options(&self) -> &DaemonOptions {
        &self.options
    }

    /// Brings the overlay up for a machine that was already a cluster
    /// member before this process started.
    pub async fn start(self: Arc<Self>) {
        if !self.store.is_initialized() {
            return;
        }
        if let Err(e) = self.clone().start_overlay().await {
            log::error!(
                "bringing up the overlay for an existing cluster member: {}",
                e.message()
            );
        }
    }

    /// Serves the machine and cluster APIs on the local socket until
    /// shutdown.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        if let Some(parent) = self.options.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&self.options.socket_path);
        let listener = UnixListener::bind(&self.options.socket_path)?;
        log::info!(
            "serving machine API on {}",
            self.options.socket_path.display()
        );
        let incoming = UnixListenerStream::new(listener);
        let mut shutdown = self.shutdown.subscribe();
        Server::builder()
            .add_service(MachineServer::new(MachineService::new(self.clone())))
            .add_service(ClusterServer::new(ClusterService::new(self.clone())))
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = shutdown.recv().await;
            })
            .await?;
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.overlay_shutdown.send(());
        let _ = self.shutdown.send(());
    }

    // Lifecycle operations -------------------------------------------------

    pub async fn init_cluster(
        self: Arc<Self>,
        request: pb::InitClusterRequest,
    ) -> Result<MachineRecord, Status> {
        if self.store.is_initialized() {
            return Err(Status::already_exists("machine is already a cluster member"));
        }
        let network: IpNet = if request.network.is_empty() {
            DEFAULT_NETWORK.parse().expect("default network is valid")
        } else {
            request.network.parse().map_err(|_| {
                Status::invalid_argument(format!("invalid cluster network {}", request.network))
            })?
        };
        let public_ip = self.resolve_public_ip(request.public_ip.as_deref()).await?;
        let endpoints = self.candidate_endpoints(public_ip);
        let record =
            self.store
                .init_cluster(network, &request.machine_name, public_ip, endpoints)?;
        log::info!(
            "initialized cluster {network}: machine {} has subnet {} and management IP {}",
            record.name,
            record.network.subnet,
            record.network.management_ip
        );
        self.clone().start_overlay().await?;
        Ok(record)
    }

    pub async fn join_cluster(
        self: Arc<Self>,
        request: pb::JoinClusterRequest,
    ) -> Result<(), Status> {
        if self.store.is_initialized() {
            return Err(Status::already_exists("machine is already a cluster member"));
        }
        let network: IpNet = request.network.parse().map_err(|_| {
            Status::invalid_argument(format!("invalid cluster network {}", request.network))
        })?;
        let info = request
            .machine
            .ok_or_else(|| Status::invalid_argument("assigned machine info is required"))?;
        let record = MachineRecord::try_from(info)?;
        let others = request
            .other_machines
            .into_iter()
            .map(MachineRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let name = record.name.clone();
        self.store.join_cluster(network, record, others)?;
        log::info!("joined cluster {network} as machine {name}");
        self.clone().start_overlay().await?;
        Ok(())
    }

    pub async fn token(&self) -> Result<String, Status> {
        let public_ip = publicip::detect().await;
        let info = TokenInfo {
            public_key: self.store.public_key(),
            endpoints: self.candidate_endpoints(public_ip),
            public_ip,
        };
        info.encode()
            .map_err(|e| Status::internal(format!("encoding machine token: {e}")))
    }

    pub fn inspect(&self) -> Result<(MachineRecord, MembershipState), Status> {
        let record = self
            .store
            .local_record()
            .ok_or_else(|| Status::failed_precondition("machine is not a member of any cluster"))?;
        Ok((record, self.store.local_state().unwrap_or(MembershipState::Up)))
    }

    pub fn check_prerequisites(&self) -> (bool, String) {
        if !self.options.manage_network {
            return (true, "overlay management is disabled".to_string());
        }
        if std::path::Path::new("/sys/module/wireguard").exists() {
            return (true, "WireGuard kernel module is loaded".to_string());
        }
        match wireguard_control::Device::list(WgBackend::Kernel) {
            Ok(_) => (true, "WireGuard kernel support is available".to_string()),
            Err(e) => (
                false,
                format!("WireGuard kernel support not detected: {e}"),
            ),
        }
    }

    /// Leaves the cluster: stops the overlay tasks, deletes the tunnel
    /// device and wipes the persisted roster. The machine keypair is kept so
    /// the operator can rejoin without rekeying.
    pub async fn reset(&self) -> Result<(), Status> {
        if !self.store.is_initialized() {
            return Err(Status::failed_precondition(
                "machine is not a member of any cluster",
            ));
        }
        let _ = self.overlay_shutdown.send(());
        if let Some(network) = &self.network {
            network
                .teardown()
                .await
                .map_err(|e| Status::internal(format!("removing tunnel interface: {e}")))?;
        }
        self.store.reset()?;
        self.director.update_local_address(String::new());
        self.director.close();
        self.overlay_started.store(false, Ordering::SeqCst);
        log::info!("machine left the cluster");
        Ok(())
    }

    pub fn inspect_service_local(&self, id: &str) -> Result<pb::InspectServiceResponse, Status> {
        // The core daemon keeps no service registry; the container runtime
        // driver layers one on top of this API.
        Err(Status::not_found(format!("service {id} not found")))
    }

    // Cluster operations ---------------------------------------------------

    pub fn list_machines_local(&self) -> Result<pb::ListMachinesResponse, Status> {
        let members = self.store.list_machines()?;
        Ok(pb::ListMachinesResponse {
            metadata: Some(Metadata::for_machine(&self.director.local_address())),
            machines: members
                .iter()
                .map(|(record, state)| pb::MachineMember {
                    machine: Some(record.into()),
                    state: pb::MembershipState::from(*state) as i32,
                })
                .collect(),
        })
    }

    /// Handles AddMachine terminating on this machine: either allocates an
    /// identity and subnet for a new machine (and, when `broadcast` is set,
    /// relays the allocated record to every peer), or adopts a record a peer
    /// relayed to us.
    pub async fn add_machine_local(
        &self,
        request: pb::AddMachineRequest,
        broadcast: bool,
    ) -> Result<pb::AddMachineResponse, Status> {
        let record = if let Some(info) = request.machine {
            let record = MachineRecord::try_from(info)?;
            if self.store.insert_machine(record.clone())? {
                log::info!(
                    "adopted machine {} with subnet {}",
                    record.name,
                    record.network.subnet
                );
                self.sync_network_after_change().await;
            }
            record
        } else {
            if request.public_key.is_empty() {
                return Err(Status::invalid_argument("public key is required"));
            }
            let public_ip = request
                .public_ip
                .as_deref()
                .map(|ip| {
                    ip.parse::<IpAddr>()
                        .map_err(|_| Status::invalid_argument(format!("invalid public IP {ip}")))
                })
                .transpose()?;
            let endpoints = parse_endpoints(&request.endpoints)?;
            let record =
                self.store
                    .add_machine(&request.name, public_ip, endpoints, request.public_key)?;
            log::info!(
                "added machine {} with subnet {}",
                record.name,
                record.network.subnet
            );
            self.sync_network_after_change().await;
            if broadcast {
                self.broadcast_add(&record).await;
            }
            record
        };
        Ok(pb::AddMachineResponse {
            metadata: Some(Metadata::for_machine(&self.director.local_address())),
            machine: Some((&record).into()),
        })
    }

    pub async fn update_machine_local(
        &self,
        request: pb::UpdateMachineRequest,
        broadcast: bool,
    ) -> Result<pb::UpdateMachineResponse, Status> {
        let name = request.name.clone().filter(|name| !name.is_empty());
        let public_ip = request
            .public_ip
            .as_deref()
            .map(|ip| {
                ip.parse::<IpAddr>()
                    .map_err(|_| Status::invalid_argument(format!("invalid public IP {ip}")))
            })
            .transpose()?;
        let endpoints = request
            .endpoints
            .as_ref()
            .map(|list| parse_endpoints(&list.endpoints))
            .transpose()?;
        let record =
            self.store
                .update_machine(&request.machine_id, name, public_ip, endpoints)?;
        self.sync_network_after_change().await;
        if broadcast {
            self.broadcast_update(request).await;
        }
        Ok(pb::UpdateMachineResponse {
            metadata: Some(Metadata::for_machine(&self.director.local_address())),
            machine: Some((&record).into()),
        })
    }

    pub async fn remove_machine_local(
        &self,
        request: pb::RemoveMachineRequest,
        broadcast: bool,
    ) -> Result<pb::RemoveMachineResponse, Status> {
        let record = self.store.remove_machine(&request.machine_id)?;
        log::info!("removed machine {} from the cluster", record.name);
        // The removed peer's connection identity is gone with it.
        self.director.flush_remote_backends();
        self.sync_network_after_change().await;
        if broadcast {
            self.broadcast_remove(request).await;
        }
        Ok(pb::RemoveMachineResponse {
            metadata: Some(Metadata::for_machine(&self.director.local_address())),
        })
    }

    // Overlay wiring -------------------------------------------------------

    pub(crate) async fn start_overlay(self: Arc<Self>) -> Result<(), Status> {
        if self.overlay_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.clone().start_overlay_inner().await;
        if result.is_err() {
            self.overlay_started.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn start_overlay_inner(self: Arc<Self>) -> Result<(), Status> {
        let record = self
            .store
            .local_record()
            .ok_or_else(|| Status::failed_precondition("machine is not a member of any cluster"))?;
        let advertise = self
            .options
            .advertise_address
            .unwrap_or(record.network.management_ip);
        self.director.update_local_address(advertise.to_string());
        self.apply_network_config().await?;

        if let (Some(network), Some(controller)) = (&self.network, &self.controller) {
            // After a rotation the pooled connection may still point at a
            // dead path, so endpoint changes flush the remote backends and
            // the next RPC re-dials.
            let mut events = controller.watch();
            let director = self.director.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    log::debug!(
                        "peer {} moved to endpoint {}",
                        event.public_key,
                        event.endpoint
                    );
                    director.flush_remote_backends();
                }
            });

            let store = self.store.clone();
            let network = network.clone();
            let mut shutdown = self.overlay_shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(RECONCILE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            let statuses = match network.peer_statuses().await {
                                Ok(statuses) => statuses,
                                Err(_) => continue,
                            };
                            let now = Instant::now();
                            for (public_key, status) in statuses {
                                store.observe(&public_key, status, now);
                            }
                        }
                    }
                }
            });

            let controller = controller.clone();
            let shutdown = self.overlay_shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = controller.run(shutdown).await {
                    log::error!("mesh controller exited: {e}");
                }
            });
        }

        let api_addr = SocketAddr::new(advertise, self.options.api_port);
        let daemon = self.clone();
        let mut shutdown = self.overlay_shutdown.subscribe();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(api_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    log::error!("binding management API at {api_addr}: {e}");
                    return;
                }
            };
            log::info!("serving management API on {api_addr}");
            let incoming = TcpListenerStream::new(listener);
            let result = Server::builder()
                .add_service(MachineServer::new(MachineService::new(daemon.clone())))
                .add_service(ClusterServer::new(ClusterService::new(daemon)))
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                log::error!("management API server: {e}");
            }
        });

        Ok(())
    }

    pub(crate) async fn apply_network_config(&self) -> Result<(), Status> {
        let Some(network) = &self.network else {
            return Ok(());
        };
        let Some(config) = self.store.device_config(self.options.listen_port) else {
            return Ok(());
        };
        let events = network
            .configure(config)
            .await
            .map_err(|e| Status::internal(format!("configuring overlay network: {e}")))?;
        if let Some(controller) = &self.controller {
            if let Err(e) = controller.publish(events).await {
                log::warn!("publishing endpoint changes: {e}");
            }
        }
        Ok(())
    }

    /// Membership is authoritative even when the kernel apply fails; the
    /// error is logged and the next apply reconciles.
    async fn sync_network_after_change(&self) {
        if let Err(e) = self.apply_network_config().await {
            log::error!(
                "reconfiguring overlay after membership change: {}",
                e.message()
            );
        }
    }

    // Broadcasts -----------------------------------------------------------

    fn broadcast_targets(&self, exclude: &[&str]) -> Vec<String> {
        self.store
            .peer_records()
            .into_iter()
            .filter(|record| !exclude.contains(&record.id.as_str()))
            .map(|record| record.network.management_ip.to_string())
            .collect()
    }

    /// Relays a freshly allocated machine record to every peer, One2Many
    /// through the proxy. The new machine itself is skipped: it receives the
    /// full roster when it joins.
    async fn broadcast_add(&self, record: &MachineRecord) {
        let targets = self.broadcast_targets(&[record.id.as_str()]);
        if targets.is_empty() {
            return;
        }
        let message = pb::AddMachineRequest {
            machine: Some(record.into()),
            ..Default::default()
        };
        let mut request = Request::new(message);
        attach_machines(request.metadata_mut(), &targets);
        let mut client = ClusterClient::new(self.director.local_backend().channel());
        match client.add_machine(request).await {
            Ok(response) => log_branch_failures(response.into_inner(), "add-machine").await,
            Err(e) => log::warn!("broadcasting machine {}: {e}", record.name),
        }
    }

    async fn broadcast_update(&self, message: pb::UpdateMachineRequest) {
        let targets = self.broadcast_targets(&[]);
        if targets.is_empty() {
            return;
        }
        let mut request = Request::new(message);
        attach_machines(request.metadata_mut(), &targets);
        let mut client = ClusterClient::new(self.director.local_backend().channel());
        match client.update_machine(request).await {
            Ok(response) => log_branch_failures(response.into_inner(), "update-machine").await,
            Err(e) => log::warn!("broadcasting machine update: {e}"),
        }
    }

    async fn broadcast_remove(&self, message: pb::RemoveMachineRequest) {
        let targets = self.broadcast_targets(&[]);
        if targets.is_empty() {
            return;
        }
        let mut request = Request::new(message);
        attach_machines(request.metadata_mut(), &targets);
        let mut client = ClusterClient::new(self.director.local_backend().channel());
        match client.remove_machine(request).await {
            Ok(response) => log_branch_failures(response.into_inner(), "remove-machine").await,
            Err(e) => log::warn!("broadcasting machine removal: {e}"),
        }
    }

    async fn resolve_public_ip(&self, requested: Option<&str>) -> Result<Option<IpAddr>, Status> {
        match requested {
            None => Ok(None),
            Some("auto") => publicip::detect().await.map(Some).ok_or_else(|| {
                Status::failed_precondition(
                    "could not detect a public IP; pass one explicitly or omit it",
                )
            }),
            Some(ip) => ip
                .parse()
                .map(Some)
                .map_err(|_| Status::invalid_argument(format!("invalid public IP {ip}"))),
        }
    }

    /// The endpoints this machine advertises to peers: the public IP first
    /// (candidates are tried in order), then every non-loopback local
    /// address except the tunnel's own.
    fn candidate_endpoints(&self, public_ip: Option<IpAddr>) -> Vec<Endpoint> {
        let port = self.options.listen_port;
        let mut endpoints = Vec::new();
        if let Some(ip) = public_ip {
            endpoints.push(Endpoint::new(ip.to_string(), port));
        }
        match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                for interface in interfaces {
                    if interface.is_loopback() || interface.name == self.options.interface {
                        continue;
                    }
                    let ip = interface.ip();
                    if Some(ip) == public_ip {
                        continue;
                    }
                    let endpoint = Endpoint::new(ip.to_string(), port);
                    if !endpoints.contains(&endpoint) {
                        endpoints.push(endpoint);
                    }
                }
            }
            Err(e) => log::warn!("enumerating local addresses: {e}"),
        }
        endpoints
    }
}

fn parse_endpoints(raw: &[String]) -> Result<Vec<Endpoint>, Status> {
    raw.iter()
        .map(|endpoint| {
            endpoint
                .parse()
                .map_err(|e: String| Status::invalid_argument(e))
        })
        .collect()
}

fn attach_machines(metadata: &mut MetadataMap, addresses: &[String]) {
    for address in addresses {
        match MetadataValue::try_from(address.as_str()) {
            Ok(value) => metadata.append(MACHINES_KEY, value),
            Err(_) => {
                log::warn!("skipping unrepresentable machine address {address}");
                continue;
            }
        };
    }
}

async fn log_branch_failures<T: WithMetadata>(mut stream: tonic::Streaming<T>, what: &str) {
    loop {
        match stream.message().await {
            Ok(Some(envelope)) => {
                let Some(metadata) = envelope.metadata() else {
                    continue;
                };
                if let Some(status) = &metadata.status {
                    log::warn!(
                        "{what} broadcast to {} failed: {} ({})",
                        metadata.machine,
                        status.message,
                        status.code
                    );
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("{what} broadcast stream: {e}");
                break;
            }
        }
    }
}
