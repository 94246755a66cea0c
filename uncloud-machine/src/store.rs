//! The membership store: the authoritative in-memory cluster roster plus its
//! on-disk persistence. The store owns the canonical machine records and
//! hands out read-only snapshots; broadcasting changes to peers is the
//! daemon's job, through the RPC proxy.

use std::{
    collections::HashMap,
    net::IpAddr,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use wireguard_control::KeyPair;

use uncloud_net::peer::PERSISTENT_KEEPALIVE_INTERVAL_SECS;
use uncloud_net::{Endpoint, PeerConfig, PeerStatus};
use uncloud_proto::v1 as pb;

use crate::config::{ClusterDoc, MachineConfig};

/// How long a down observation must persist before a machine becomes
/// SUSPECT.
pub const SUSPECT_DELAY: Duration = Duration::from_secs(10);
/// How long a SUSPECT machine may go unrefuted before it is confirmed DOWN.
pub const CONFIRM_DELAY: Duration = Duration::from_secs(60);

/// Prefix length of per-machine subnets carved from an IPv4 cluster network.
const SUBNET_PREFIX_V4: u8 = 24;
/// Prefix length of per-machine subnets carved from an IPv6 cluster network.
const SUBNET_PREFIX_V6: u8 = 80;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid machine config: {0}")]
    InvalidConfig(String),

    #[error("invalid machine record: {0}")]
    InvalidRecord(String),

    #[error("machine is already a cluster member")]
    AlreadyInitialized,

    #[error("machine is not a member of any cluster")]
    NotInitialized,

    #[error("machine {0} is not part of the cluster")]
    UnknownMachine(String),

    #[error("a machine with public key {0} already exists")]
    DuplicateKey(String),

    #[error("subnet {0} overlaps an existing machine subnet")]
    SubnetConflict(IpNet),

    #[error("no free subnets left in cluster network {0}")]
    SubnetsExhausted(IpNet),

    #[error("cannot remove the local machine from its own cluster")]
    RemoveSelf,

    #[error("the assigned public key does not match this machine's key")]
    KeyMismatch,

    #[error("invalid cluster network {0}: {1}")]
    InvalidNetwork(IpNet, String),
}

impl From<StoreError> for tonic::Status {
    fn from(error: StoreError) -> Self {
        use tonic::Status;
        match &error {
            StoreError::InvalidConfig(_)
            | StoreError::InvalidRecord(_)
            | StoreError::InvalidNetwork(..)
            | StoreError::RemoveSelf
            | StoreError::KeyMismatch => Status::invalid_argument(error.to_string()),
            StoreError::AlreadyInitialized | StoreError::DuplicateKey(_) => {
                Status::already_exists(error.to_string())
            }
            StoreError::NotInitialized
            | StoreError::SubnetConflict(_)
            | StoreError::SubnetsExhausted(_) => Status::failed_precondition(error.to_string()),
            StoreError::UnknownMachine(_) => Status::not_found(error.to_string()),
            StoreError::Io(_) => Status::internal(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipState {
    Up,
    Suspect,
    Down,
}

impl MembershipState {
    /// SUSPECT is treated as UP for routing until resolved.
    pub fn routable(self) -> bool {
        matches!(self, MembershipState::Up | MembershipState::Suspect)
    }
}

impl From<MembershipState> for pb::MembershipState {
    fn from(state: MembershipState) -> Self {
        match state {
            MembershipState::Up => pb::MembershipState::Up,
            MembershipState::Suspect => pb::MembershipState::Suspect,
            MembershipState::Down => pb::MembershipState::Down,
        }
    }
}

/// A machine's overlay network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub subnet: IpNet,
    pub management_ip: IpAddr,
    pub endpoints: Vec<Endpoint>,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<IpAddr>,
    pub network: NetworkConfig,
}

impl From<&MachineRecord> for pb::MachineInfo {
    fn from(record: &MachineRecord) -> Self {
        pb::MachineInfo {
            id: record.id.clone(),
            name: record.name.clone(),
            public_ip: record.public_ip.map(|ip| ip.to_string()),
            network: Some(pb::NetworkConfig {
                subnet: record.network.subnet.to_string(),
                management_ip: record.network.management_ip.to_string(),
                endpoints: record
                    .network
                    .endpoints
                    .iter()
                    .map(|endpoint| endpoint.to_string())
                    .collect(),
                public_key: record.network.public_key.clone(),
            }),
        }
    }
}

impl TryFrom<pb::MachineInfo> for MachineRecord {
    type Error = StoreError;

    fn try_from(info: pb::MachineInfo) -> Result<Self, Self::Error> {
        let invalid = |what: &str| StoreError::InvalidRecord(what.to_string());
        if info.id.is_empty() {
            return Err(invalid("machine id is empty"));
        }
        let network = info.network.ok_or_else(|| invalid("network config missing"))?;
        if network.public_key.is_empty() {
            return Err(invalid("public key is empty"));
        }
        let subnet: IpNet = network
            .subnet
            .parse()
            .map_err(|_| StoreError::InvalidRecord(format!("invalid subnet {}", network.subnet)))?;
        let management_ip: IpAddr = network.management_ip.parse().map_err(|_| {
            StoreError::InvalidRecord(format!("invalid management IP {}", network.management_ip))
        })?;
        if !subnet.contains(&management_ip) {
            return Err(StoreError::InvalidRecord(format!(
                "management IP {management_ip} is outside subnet {subnet}"
            )));
        }
        let endpoints = network
            .endpoints
            .iter()
            .map(|endpoint| endpoint.parse().map_err(StoreError::InvalidRecord))
            .collect::<Result<Vec<Endpoint>, _>>()?;
        let public_ip = info
            .public_ip
            .as_deref()
            .map(|ip| {
                ip.parse()
                    .map_err(|_| StoreError::InvalidRecord(format!("invalid public IP {ip}")))
            })
            .transpose()?;
        Ok(MachineRecord {
            id: info.id,
            name: info.name,
            public_ip,
            network: NetworkConfig {
                subnet,
                management_ip,
                endpoints,
                public_key: network.public_key,
            },
        })
    }
}

#[derive(Debug)]
struct MachineState {
    record: MachineRecord,
    state: MembershipState,
    down_since: Option<Instant>,
    suspect_since: Option<Instant>,
}

impl MachineState {
    fn new(record: MachineRecord) -> Self {
        MachineState {
            record,
            state: MembershipState::Up,
            down_since: None,
            suspect_since: None,
        }
    }
}

#[derive(Debug)]
struct Cluster {
    network: IpNet,
    local_id: String,
    machines: HashMap<String, MachineState>,
}

struct Inner {
    private_key: String,
    public_key: String,
    cluster: Option<Cluster>,
}

pub struct ClusterStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ClusterStore {
    /// Opens the persisted machine state, generating a fresh keypair when
    /// none exists yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let config = if path.exists() {
            MachineConfig::from_file(path)?
        } else {
            let keypair = KeyPair::generate();
            let config = MachineConfig {
                private_key: keypair.private.to_base64(),
                cluster: None,
            };
            config.write_to_path(path)?;
            config
        };

        let private_key = config.private_key.clone();
        let public_key = wireguard_control::Key::from_base64(&private_key)
            .map_err(|e| StoreError::InvalidConfig(format!("invalid private key: {e}")))?
            .get_public()
            .to_base64();

        let cluster = config
            .cluster
            .map(|doc| {
                if !doc.machines.iter().any(|m| m.id == doc.machine_id) {
                    return Err(StoreError::InvalidConfig(format!(
                        "local machine {} missing from persisted roster",
                        doc.machine_id
                    )));
                }
                Ok(Cluster {
                    network: doc.network,
                    local_id: doc.machine_id,
                    machines: doc
                        .machines
                        .into_iter()
                        .map(|record| (record.id.clone(), MachineState::new(record)))
                        .collect(),
                })
            })
            .transpose()?;

        Ok(ClusterStore {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                private_key,
                public_key,
                cluster,
            }),
        })
    }

    pub fn public_key(&self) -> String {
        self.inner.lock().public_key.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().cluster.is_some()
    }

    pub fn cluster_network(&self) -> Option<IpNet> {
        self.inner.lock().cluster.as_ref().map(|c| c.network)
    }

    pub fn local_record(&self) -> Option<MachineRecord> {
        let inner = self.inner.lock();
        let cluster = inner.cluster.as_ref()?;
        cluster
            .machines
            .get(&cluster.local_id)
            .map(|m| m.record.clone())
    }

    pub fn local_state(&self) -> Option<MembershipState> {
        let inner = self.inner.lock();
        let cluster = inner.cluster.as_ref()?;
        cluster.machines.get(&cluster.local_id).map(|m| m.state)
    }

    /// Every machine except the local one.
    pub fn peer_records(&self) -> Vec<MachineRecord> {
        let inner = self.inner.lock();
        let Some(cluster) = inner.cluster.as_ref() else {
            return Vec::new();
        };
        let mut peers: Vec<MachineRecord> = cluster
            .machines
            .values()
            .filter(|m| m.record.id != cluster.local_id)
            .map(|m| m.record.clone())
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    /// Initializes a new single-machine cluster: the local machine gets the
    /// first free subnet of `network` and its first host as management IP.
    pub fn init_cluster(
        &self,
        network: IpNet,
        name: &str,
        public_ip: Option<IpAddr>,
        endpoints: Vec<Endpoint>,
    ) -> Result<MachineRecord, StoreError> {
        let mut inner = self.inner.lock();
        if inner.cluster.is_some() {
            return Err(StoreError::AlreadyInitialized);
        }
        let subnet = allocate_subnet(network, &[])?;
        let id = new_machine_id();
        let name = if name.is_empty() {
            format!("machine-{}", &id[..8])
        } else {
            name.to_string()
        };
        let record = MachineRecord {
            id,
            name,
            public_ip,
            network: NetworkConfig {
                subnet,
                management_ip: first_host(subnet)?,
                endpoints,
                public_key: inner.public_key.clone(),
            },
        };
        inner.cluster = Some(Cluster {
            network,
            local_id: record.id.clone(),
            machines: HashMap::from([(record.id.clone(), MachineState::new(record.clone()))]),
        });
        self.persist(&inner)?;
        Ok(record)
    }

    /// Adopts the identity and roster assigned by an existing cluster
    /// member. The assigned record must carry this machine's public key.
    pub fn join_cluster(
        &self,
        network: IpNet,
        record: MachineRecord,
        others: Vec<MachineRecord>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.cluster.is_some() {
            return Err(StoreError::AlreadyInitialized);
        }
        if record.network.public_key != inner.public_key {
            return Err(StoreError::KeyMismatch);
        }
        let mut machines = HashMap::new();
        machines.insert(record.id.clone(), MachineState::new(record.clone()));
        for other in others {
            if other.id == record.id {
                continue;
            }
            machines.insert(other.id.clone(), MachineState::new(other));
        }
        inner.cluster = Some(Cluster {
            network,
            local_id: record.id,
            machines,
        });
        self.persist(&inner)?;
        Ok(())
    }

    /// Allocates an identity and subnet for a new machine and adds it to the
    /// roster.
    pub fn add_machine(
        &self,
        name: &str,
        public_ip: Option<IpAddr>,
        endpoints: Vec<Endpoint>,
        public_key: String,
    ) -> Result<MachineRecord, StoreError> {
        let mut inner = self.inner.lock();
        let cluster = inner.cluster.as_mut().ok_or(StoreError::NotInitialized)?;
        if cluster
            .machines
            .values()
            .any(|m| m.record.network.public_key == public_key)
        {
            return Err(StoreError::DuplicateKey(public_key));
        }
        let taken: Vec<IpNet> = cluster
            .machines
            .values()
            .map(|m| m.record.network.subnet)
            .collect();
        let subnet = allocate_subnet(cluster.network, &taken)?;
        let id = new_machine_id();
        let name = if name.is_empty() {
            format!("machine-{}", &id[..8])
        } else {
            name.to_string()
        };
        let record = MachineRecord {
            id,
            name,
            public_ip,
            network: NetworkConfig {
                subnet,
                management_ip: first_host(subnet)?,
                endpoints,
                public_key,
            },
        };
        cluster
            .machines
            .insert(record.id.clone(), MachineState::new(record.clone()));
        self.persist(&inner)?;
        Ok(record)
    }

    /// Adopts a record allocated elsewhere and relayed by a peer. Returns
    /// whether the roster changed.
    pub fn insert_machine(&self, record: MachineRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let cluster = inner.cluster.as_mut().ok_or(StoreError::NotInitialized)?;
        let overlaps = cluster.machines.values().any(|m| {
            m.record.id != record.id
                && (m.record.network.subnet.contains(&record.network.subnet)
                    || record.network.subnet.contains(&m.record.network.subnet))
        });
        if overlaps {
            return Err(StoreError::SubnetConflict(record.network.subnet));
        }
        match cluster.machines.get_mut(&record.id) {
            Some(existing) if existing.record == record => Ok(false),
            Some(existing) => {
                existing.record = record;
                self.persist(&inner)?;
                Ok(true)
            }
            None => {
                cluster
                    .machines
                    .insert(record.id.clone(), MachineState::new(record));
                self.persist(&inner)?;
                Ok(true)
            }
        }
    }

    /// Replaces the named fields of a machine; unspecified fields are left
    /// unchanged.
    pub fn update_machine(
        &self,
        id: &str,
        name: Option<String>,
        public_ip: Option<IpAddr>,
        endpoints: Option<Vec<Endpoint>>,
    ) -> Result<MachineRecord, StoreError> {
        let mut inner = self.inner.lock();
        let cluster = inner.cluster.as_mut().ok_or(StoreError::NotInitialized)?;
        let machine = cluster
            .machines
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMachine(id.to_string()))?;
        if let Some(name) = name {
            machine.record.name = name;
        }
        if let Some(public_ip) = public_ip {
            machine.record.public_ip = Some(public_ip);
        }
        if let Some(endpoints) = endpoints {
            machine.record.network.endpoints = endpoints;
        }
        let record = machine.record.clone();
        self.persist(&inner)?;
        Ok(record)
    }

    pub fn remove_machine(&self, id: &str) -> Result<MachineRecord, StoreError> {
        let mut inner = self.inner.lock();
        let cluster = inner.cluster.as_mut().ok_or(StoreError::NotInitialized)?;
        if cluster.local_id == id {
            return Err(StoreError::RemoveSelf);
        }
        let removed = cluster
            .machines
            .remove(id)
            .ok_or_else(|| StoreError::UnknownMachine(id.to_string()))?;
        self.persist(&inner)?;
        Ok(removed.record)
    }

    /// The roster with per-machine membership state, sorted by name for
    /// stable output.
    pub fn list_machines(&self) -> Result<Vec<(MachineRecord, MembershipState)>, StoreError> {
        let inner = self.inner.lock();
        let cluster = inner.cluster.as_ref().ok_or(StoreError::NotInitialized)?;
        let mut members: Vec<(MachineRecord, MembershipState)> = cluster
            .machines
            .values()
            .map(|m| (m.record.clone(), m.state))
            .collect();
        members.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        Ok(members)
    }

    pub fn machine_id_for_key(&self, public_key: &str) -> Option<String> {
        let inner = self.inner.lock();
        let cluster = inner.cluster.as_ref()?;
        cluster
            .machines
            .values()
            .find(|m| m.record.network.public_key == public_key)
            .map(|m| m.record.id.clone())
    }

    /// Applies a liveness observation from the mesh. UP → SUSPECT once a
    /// down observation has persisted `SUSPECT_DELAY`; SUSPECT → DOWN after
    /// `CONFIRM_DELAY` without refutation; any up observation returns the
    /// machine to UP.
    pub fn observe(&self, public_key: &str, status: PeerStatus, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(cluster) = inner.cluster.as_mut() else {
            return;
        };
        let Some(machine) = cluster
            .machines
            .values_mut()
            .find(|m| m.record.network.public_key == public_key)
        else {
            return;
        };

        match status {
            PeerStatus::Up => {
                if machine.state != MembershipState::Up {
                    log::info!("machine {} is reachable again", machine.record.name);
                }
                machine.state = MembershipState::Up;
                machine.down_since = None;
                machine.suspect_since = None;
            }
            PeerStatus::Down => {
                let down_since = *machine.down_since.get_or_insert(now);
                match machine.state {
                    MembershipState::Up
                        if now.duration_since(down_since) >= SUSPECT_DELAY =>
                    {
                        log::warn!("machine {} is suspected down", machine.record.name);
                        machine.state = MembershipState::Suspect;
                        machine.suspect_since = Some(now);
                    }
                    MembershipState::Suspect
                        if machine
                            .suspect_since
                            .map_or(false, |since| now.duration_since(since) >= CONFIRM_DELAY) =>
                    {
                        log::warn!("machine {} is confirmed down", machine.record.name);
                        machine.state = MembershipState::Down;
                    }
                    _ => {}
                }
            }
        }
    }

    /// The tunnel configuration implied by the current roster, or `None`
    /// before the machine has joined a cluster.
    pub fn device_config(&self, listen_port: u16) -> Option<uncloud_net::Config> {
        let inner = self.inner.lock();
        let cluster = inner.cluster.as_ref()?;
        let local = cluster.machines.get(&cluster.local_id)?;
        let peers = cluster
            .machines
            .values()
            .filter(|m| m.record.id != cluster.local_id)
            .map(|m| PeerConfig {
                public_key: m.record.network.public_key.clone(),
                endpoint: None,
                candidates: m.record.network.endpoints.clone(),
                allowed_ips: vec![m.record.network.subnet],
                persistent_keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
            })
            .collect();
        Some(uncloud_net::Config {
            private_key: inner.private_key.clone(),
            listen_port,
            management_ip: local.record.network.management_ip,
            subnet: local.record.network.subnet,
            peers,
        })
    }

    /// Leaves the cluster, keeping the machine keypair so the operator can
    /// rejoin without rekeying.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.cluster = None;
        self.persist(&inner)
    }

    fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let config = MachineConfig {
            private_key: inner.private_key.clone(),
            cluster: inner.cluster.as_ref().map(|cluster| {
                let mut machines: Vec<MachineRecord> = cluster
                    .machines
                    .values()
                    .map(|m| m.record.clone())
                    .collect();
                machines.sort_by(|a, b| a.id.cmp(&b.id));
                ClusterDoc {
                    network: cluster.network,
                    machine_id: cluster.local_id.clone(),
                    machines,
                }
            }),
        };
        config.write_to_path(&self.path)
    }
}

fn new_machine_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// First usable host of a subnet, used as the machine's management IP.
fn first_host(subnet: IpNet) -> Result<IpAddr, StoreError> {
    subnet
        .hosts()
        .next()
        .ok_or_else(|| StoreError::InvalidNetwork(subnet, "subnet has no usable hosts".to_string()))
}

/// Finds the first subnet of `network` that is disjoint from every taken
/// subnet.
fn allocate_subnet(network: IpNet, taken: &[IpNet]) -> Result<IpNet, StoreError> {
    let prefix = match network {
        IpNet::V4(_) => SUBNET_PREFIX_V4.max(network.prefix_len()),
        IpNet::V6(_) => SUBNET_PREFIX_V6.max(network.prefix_len()),
    };
    let mut subnets = network
        .subnets(prefix)
        .map_err(|e| StoreError::InvalidNetwork(network, e.to_string()))?;
    subnets
        .find(|candidate| {
            taken
                .iter()
                .all(|t| !t.contains(candidate) && !candidate.contains(t))
        })
        .ok_or(StoreError::SubnetsExhausted(network))
}
