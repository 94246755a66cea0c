//! The persisted machine state document: identity, private key, and the
//! last-known cluster roster, so a restarted daemon rejoins without
//! rekeying.

use std::{
    fs::{self, OpenOptions},
    io::{Read, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::store::{MachineRecord, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// The machine's WireGuard private key, base64-encoded. Generated on
    /// first start and kept across cluster resets.
    pub private_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDoc {
    /// The cluster overlay network all machine subnets are carved from.
    pub network: IpNet,
    pub machine_id: String,
    pub machines: Vec<MachineRecord>,
}

impl MachineConfig {
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        toml::from_str(&contents).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    pub fn write_to_path(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        // The document holds the machine's private key.
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NetworkConfig;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.toml");

        let config = MachineConfig {
            private_key: "8Fsd1xuYLJBBYQLbUoeOD4cO+cVyEGUfX282Sy9aW28=".to_string(),
            cluster: Some(ClusterDoc {
                network: "10.210.0.0/16".parse().unwrap(),
                machine_id: "m1".to_string(),
                machines: vec![MachineRecord {
                    id: "m1".to_string(),
                    name: "first".to_string(),
                    public_ip: Some("203.0.113.5".parse().unwrap()),
                    network: NetworkConfig {
                        subnet: "10.210.0.0/24".parse().unwrap(),
                        management_ip: "10.210.0.1".parse().unwrap(),
                        endpoints: vec!["203.0.113.5:51820".parse().unwrap()],
                        public_key: "pk".to_string(),
                    },
                }],
            }),
        };
        config.write_to_path(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = MachineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.private_key, config.private_key);
        let cluster = loaded.cluster.unwrap();
        assert_eq!(cluster.machine_id, "m1");
        assert_eq!(cluster.machines, config.cluster.unwrap().machines);
    }

    #[test]
    fn pre_cluster_document_omits_roster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.toml");

        let config = MachineConfig {
            private_key: "key".to_string(),
            cluster: None,
        };
        config.write_to_path(&path).unwrap();

        let loaded = MachineConfig::from_file(&path).unwrap();
        assert!(loaded.cluster.is_none());
    }
}
