//! Lock-file flags and cluster mode detection.

use muster_common::constants::locks;
use muster_common::{ClusterError, ClusterMode};

use super::files;
use crate::paths::Paths;

/// Presence flags under `var/lock`
#[derive(Debug, Clone)]
pub struct LockFiles {
    paths: Paths,
}

impl LockFiles {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn has(&self, name: &str) -> bool {
        self.paths.lock(name).exists()
    }

    pub fn create(&self, name: &str) -> Result<(), ClusterError> {
        files::touch(&self.paths.lock(name))
    }

    pub fn remove(&self, name: &str) -> Result<bool, ClusterError> {
        files::remove_if_exists(&self.paths.lock(name))
    }

    /// Current cluster mode as recorded on disk
    pub fn mode(&self) -> ClusterMode {
        ClusterMode::from_locks(
            self.has(locks::HA_CLUSTER),
            self.has(locks::CLUSTERED),
            self.has(locks::NO_APISERVER_PROXY),
        )
    }

    pub fn is_kubelite(&self) -> bool {
        self.has(locks::KUBELITE)
    }

    /// Flag a node that runs workloads only
    pub fn mark_worker(&self) -> Result<(), ClusterError> {
        self.create(locks::CLUSTERED)?;
        self.create(locks::NO_CONSENSUS_STORE)
    }

    /// Clear the worker flags; fails if the node was never marked
    pub fn unmark_worker(&self) -> Result<(), ClusterError> {
        for lock in [locks::CLUSTERED, locks::NO_CONSENSUS_STORE] {
            if !self.remove(lock)? {
                return Err(ClusterError::LocalState("Not in clustering mode.".into()));
            }
        }
        Ok(())
    }
}
