//! Application state and shared resources.

use std::sync::Arc;

use muster_common::constants::{DEFAULT_AGENT_PORT, args as arg, files as layout};
use muster_common::{ClusterError, ClusterMode};

use crate::certs::{CertificateSigner, OpensslSigner};
use crate::config::AppConfig;
use crate::consensus::ConsensusBackend;
use crate::exec::{CommandRunner, SystemRunner};
use crate::kube::{KubeClient, Kubectl};
use crate::membership::{DqliteMembership, MembershipAdapter};
use crate::paths::Paths;
use crate::services::ServiceManager;
use crate::store::{CredentialStore, LockFiles, ServiceArgs, files};

/// Shared node state, used by the agent handlers and the CLI operations
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    pub paths: Paths,

    /// Join, certificate request, callback and identity tokens
    pub credentials: Arc<CredentialStore>,

    pub args: ServiceArgs,

    pub locks: LockFiles,

    pub services: ServiceManager,

    pub consensus: ConsensusBackend,

    pub runner: Arc<dyn CommandRunner>,

    pub membership: Arc<dyn MembershipAdapter>,

    pub signer: Arc<dyn CertificateSigner>,

    pub kube: Arc<dyn KubeClient>,
}

impl AppState {
    /// Wire the state against the real node tools
    pub fn new(config: AppConfig) -> Self {
        let paths = config.paths();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(config.command_timeout()));
        let membership = Arc::new(DqliteMembership::new(runner.clone(), paths.clone()));
        let signer = Arc::new(OpensslSigner::new(runner.clone(), paths.clone()));
        let kube = Arc::new(Kubectl::new(runner.clone(), paths.clone()));
        Self::with_parts(config, runner, membership, signer, kube)
    }

    pub fn with_parts(
        config: AppConfig,
        runner: Arc<dyn CommandRunner>,
        membership: Arc<dyn MembershipAdapter>,
        signer: Arc<dyn CertificateSigner>,
        kube: Arc<dyn KubeClient>,
    ) -> Self {
        let paths = config.paths();
        Self {
            credentials: Arc::new(CredentialStore::new(paths.clone())),
            args: ServiceArgs::new(paths.clone()),
            locks: LockFiles::new(paths.clone()),
            services: ServiceManager::new(runner.clone(), paths.clone()),
            consensus: ConsensusBackend::new(paths.clone()),
            paths,
            config,
            runner,
            membership,
            signer,
            kube,
        }
    }

    /// Cluster mode as currently recorded by the lock files.
    ///
    /// Read on every call: joins performed while the agent runs change it.
    pub fn mode(&self) -> ClusterMode {
        self.locks.mode()
    }

    /// The API server accepts tokens from `known_tokens.csv`
    pub fn token_auth_enabled(&self) -> Result<bool, ClusterError> {
        self.args.has("kube-apiserver", arg::TOKEN_AUTH_FILE)
    }

    /// Port the local cluster agent binds to
    pub fn agent_port(&self) -> Result<String, ClusterError> {
        let bind = self.args.get("cluster-agent", arg::BIND)?;
        Ok(bind
            .as_deref()
            .and_then(|b| b.rsplit_once(':'))
            .map(|(_, port)| port.to_string())
            .unwrap_or_else(|| DEFAULT_AGENT_PORT.to_string()))
    }

    /// Secure port of the local API server
    pub fn api_port(&self) -> Result<String, ClusterError> {
        Ok(self
            .args
            .get("kube-apiserver", arg::SECURE_PORT)?
            .unwrap_or_else(|| muster_common::constants::DEFAULT_APISERVER_PORT.to_string()))
    }

    /// Read a file under the data root that must exist
    pub fn read_data(&self, relative: &str) -> Result<String, ClusterError> {
        files::read_required(&self.paths.data(relative))
    }

    /// Replace a file under the data root, keeping a backup
    pub fn write_data(&self, relative: &str, contents: &str) -> Result<(), ClusterError> {
        files::replace_with_backup(&self.paths.data(relative), contents)
    }

    pub fn ca_cert(&self) -> Result<String, ClusterError> {
        self.read_data(layout::CA_CERT)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestNode;
    use super::*;
    use muster_common::constants::locks;

    #[test]
    fn test_mode_is_read_from_disk_each_time() {
        let node = TestNode::new();
        assert_eq!(node.state.mode(), ClusterMode::ConsensusControlPlane);
        node.state.locks.mark_worker().unwrap();
        assert_eq!(node.state.mode(), ClusterMode::ConsensusWorker);
        node.state.locks.remove(locks::HA_CLUSTER).unwrap();
        assert_eq!(node.state.mode(), ClusterMode::LegacyReplicated);
    }

    #[test]
    fn test_ports_and_auth_from_args() {
        let node = TestNode::new();
        assert_eq!(node.state.agent_port().unwrap(), "25000");
        assert_eq!(node.state.api_port().unwrap(), "16443");
        assert!(node.state.token_auth_enabled().unwrap());

        node.write("args/cluster-agent", "--bind=[::]:25001\n");
        assert_eq!(node.state.agent_port().unwrap(), "25001");
        node.disable_token_auth();
        assert!(!node.state.token_auth_enabled().unwrap());
    }
}
