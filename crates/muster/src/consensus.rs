//! Consensus store directory (`var/kubernetes/backend`).
//!
//! The store engine reads `init.yaml` on first start and `update.yaml`
//! on restart; `info.yaml` records the address it currently binds to.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use muster_common::constants::DEFAULT_CONSENSUS_PORT;
use muster_common::{ClusterError, join_host_port};

use crate::paths::Paths;
use crate::store::files;

const CLUSTER_CERT: &str = "cluster.crt";
const CLUSTER_KEY: &str = "cluster.key";

#[derive(Debug, Serialize)]
struct InitDescriptor<'a> {
    #[serde(rename = "Cluster", skip_serializing_if = "<[String]>::is_empty")]
    cluster: &'a [String],
    #[serde(rename = "Address")]
    address: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeInfoFile {
    #[serde(rename = "Address", default)]
    address: String,
}

/// Files of the local consensus store
#[derive(Debug, Clone)]
pub struct ConsensusBackend {
    paths: Paths,
}

impl ConsensusBackend {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn dir(&self) -> PathBuf {
        self.paths.backend()
    }

    fn file(&self, name: &str) -> PathBuf {
        self.paths.backend().join(name)
    }

    /// Descriptor for a store joining `voters` (empty for a fresh standalone store)
    pub fn write_init(&self, voters: &[String], address: &str) -> Result<(), ClusterError> {
        let yaml = serde_yaml::to_string(&InitDescriptor {
            cluster: voters,
            address,
        })
        .map_err(|e| ClusterError::Internal(format!("init descriptor: {e}")))?;
        files::replace_with_backup(&self.file("init.yaml"), yaml)
    }

    /// Ask the running store to rebind to `host`, keeping its port
    pub fn write_update(&self, host: &str) -> Result<String, ClusterError> {
        let port = port_of(&self.dir())?;
        let address = join_host_port(host, port);
        let yaml = serde_yaml::to_string(&NodeInfoFile {
            address: address.clone(),
        })
        .map_err(|e| ClusterError::Internal(format!("update descriptor: {e}")))?;
        files::replace_with_backup(&self.file("update.yaml"), yaml)?;
        Ok(address)
    }

    /// Port the local store listens on
    pub fn local_port(&self) -> Result<u16, ClusterError> {
        port_of(&self.dir())
    }

    /// Port recorded in the backup directory
    pub fn backup_port(&self) -> Result<u16, ClusterError> {
        port_of(&self.paths.backend_backup())
    }

    pub fn cluster_cert(&self) -> Result<String, ClusterError> {
        files::read_required(&self.file(CLUSTER_CERT))
    }

    pub fn cluster_key(&self) -> Result<String, ClusterError> {
        files::read_required(&self.file(CLUSTER_KEY))
    }

    pub fn store_cluster_certs(&self, cert: &str, key: &str) -> Result<(), ClusterError> {
        files::replace_with_backup(&self.file(CLUSTER_CERT), cert)?;
        files::replace_with_backup(&self.file(CLUSTER_KEY), key)
    }

    /// Move the store directory aside and start an empty one
    pub fn move_to_backup(&self) -> Result<(), ClusterError> {
        let dir = self.dir();
        let backup = self.paths.backend_backup();
        remove_dir(&backup)?;
        if dir.exists() {
            fs::rename(&dir, &backup).map_err(|e| ClusterError::io(dir.display(), e))?;
        }
        fs::create_dir_all(&dir).map_err(|e| ClusterError::io(dir.display(), e))
    }

    /// Wipe the store directory
    pub fn reset_dir(&self) -> Result<(), ClusterError> {
        let dir = self.dir();
        remove_dir(&dir)?;
        fs::create_dir_all(&dir).map_err(|e| ClusterError::io(dir.display(), e))
    }

    /// Copy the pre-cluster certificate pair back, if one was kept
    pub fn restore_certs_from_backup(&self) -> Result<bool, ClusterError> {
        let backup = self.paths.backend_backup();
        let (cert, key) = (backup.join(CLUSTER_CERT), backup.join(CLUSTER_KEY));
        if !cert.is_file() || !key.is_file() {
            return Ok(false);
        }
        files::copy_with_backup(&cert, &self.file(CLUSTER_CERT))?;
        files::copy_with_backup(&key, &self.file(CLUSTER_KEY))?;
        Ok(true)
    }

    pub fn cert_paths(&self) -> (PathBuf, PathBuf) {
        (self.file(CLUSTER_CERT), self.file(CLUSTER_KEY))
    }
}

fn remove_dir(dir: &Path) -> Result<(), ClusterError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClusterError::io(dir.display(), e)),
    }
}

/// Port from `<dir>/info.yaml`, falling back to the default port
fn port_of(dir: &Path) -> Result<u16, ClusterError> {
    let Some(contents) = files::read_optional(&dir.join("info.yaml"))? else {
        return Ok(DEFAULT_CONSENSUS_PORT);
    };
    let info: NodeInfoFile = serde_yaml::from_str(&contents)
        .map_err(|e| ClusterError::LocalState(format!("invalid consensus node info: {e}")))?;
    Ok(info
        .address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(DEFAULT_CONSENSUS_PORT))
}
