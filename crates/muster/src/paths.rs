//! Well-known node paths.

use std::path::{Path, PathBuf};

use muster_common::constants::files;

/// Resolves files under the node data root and the install root.
#[derive(Debug, Clone)]
pub struct Paths {
    data: PathBuf,
    snap: PathBuf,
}

impl Paths {
    pub fn new(data: impl Into<PathBuf>, snap: impl Into<PathBuf>) -> Self {
        Self {
            data: data.into(),
            snap: snap.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data
    }

    /// A file relative to the node data root (see `constants::files`)
    pub fn data(&self, relative: &str) -> PathBuf {
        self.data.join(relative)
    }

    /// A file relative to the install root
    pub fn snap(&self, relative: &str) -> PathBuf {
        self.snap.join(relative)
    }

    pub fn lock(&self, name: &str) -> PathBuf {
        self.data.join("var/lock").join(name)
    }

    pub fn args(&self, service: &str) -> PathBuf {
        self.data.join("args").join(service)
    }

    pub fn default_args(&self, service: &str) -> PathBuf {
        self.snap.join("default-args").join(service)
    }

    pub fn backend(&self) -> PathBuf {
        self.data.join(files::BACKEND_DIR)
    }

    pub fn backend_backup(&self) -> PathBuf {
        self.data.join(files::BACKEND_BACKUP_DIR)
    }

    pub fn kubectl(&self) -> PathBuf {
        self.snap.join("microk8s-kubectl.wrapper")
    }

    pub fn consensus_cli(&self) -> PathBuf {
        self.snap.join("bin/dqlite")
    }

    pub fn utils_script(&self) -> PathBuf {
        self.snap.join("actions/common/utils.sh")
    }
}
