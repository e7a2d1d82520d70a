//! Leaving the cluster and returning to a standalone node.

use muster_common::constants::{DEFAULT_CONSENSUS_PORT, files as layout, locks};
use muster_common::{ClusterError, ClusterMode, join_host_port};

use crate::cni;
use crate::membership::{sole_voter_with_dependents, split_local};
use crate::network::{local_hostname, self_addresses};
use crate::state::AppState;
use crate::store::files;

const LOOPBACK: &str = "127.0.0.1";

/// Leave the cluster, using the reset that matches the current mode
pub async fn leave(node: &AppState) -> Result<(), ClusterError> {
    let mode = node.mode();
    tracing::info!(%mode, "Leaving the cluster");
    match mode {
        ClusterMode::Single => Err(ClusterError::LocalState("Not in clustering mode.".into())),
        ClusterMode::LegacyReplicated => reset_legacy(node).await,
        ClusterMode::ConsensusWorker => reset_worker(node).await,
        ClusterMode::ConsensusControlPlane => reset_control_plane(node).await,
    }?;
    tracing::info!("👋 Left the cluster");
    Ok(())
}

async fn reset_legacy(node: &AppState) -> Result<(), ClusterError> {
    for service in ["kubelet", "kube-proxy", "flanneld"] {
        node.args.restore_default(service)?;
    }
    restore_kubeconfigs(node)?;
    for file in [layout::REMOTE_CA_CERT, layout::REMOTE_SERVER_CERT] {
        files::remove_if_exists(&node.paths.data(file))?;
    }
    node.locks.unmark_worker()?;
    node.locks.remove(locks::NO_CERT_REISSUE)?;

    node.services
        .restart_each(&["etcd", "flanneld", "kube-apiserver", "kubelet", "kube-proxy"])
        .await
}

async fn reset_worker(node: &AppState) -> Result<(), ClusterError> {
    node.locks.create(locks::NO_APISERVER_PROXY)?;
    files::remove_if_exists(&node.paths.data(layout::REMOTE_CA_CERT))?;
    node.services.stop("kube-apiserver").await?;
    node.services.stop("k8s-dqlite").await?;

    reinit_standalone_store(node).await?;
    for service in ["kubelet", "kube-proxy"] {
        node.args.restore_default(service)?;
    }
    restore_kubeconfigs(node)?;
    node.locks.unmark_worker()?;
    node.locks.remove(locks::NO_CERT_REISSUE)?;

    node.services.restart_all().await?;
    apply_cni(node).await
}

async fn reset_control_plane(node: &AppState) -> Result<(), ClusterError> {
    let ours = self_addresses(node.runner.as_ref()).await?;
    let members = node.membership.list_members().await?;
    if sole_voter_with_dependents(&members, &ours) {
        return Err(ClusterError::QuorumSafety(
            "This node is the only voter of a cluster other nodes depend on. \
             Remove the other nodes, or add voters, before leaving."
                .into(),
        ));
    }
    let (mine, others) = split_local(&members, &ours);

    // The local member serves the removal, so the store stays up until then
    node.services.stop("kube-apiserver").await?;
    if !others.is_empty() {
        for address in &mine {
            node.membership.remove_member(address).await?;
            tracing::info!(%address, "Removed from the consensus store");
        }
    }
    node.services.stop("k8s-dqlite").await?;
    tokio::time::sleep(node.config.retry.service_settle()).await;

    reinit_standalone_store(node).await?;
    node.locks.remove(locks::NO_CERT_REISSUE)?;

    node.services.restart_all().await?;
    apply_cni(node).await
}

/// Reset the consensus directory to a single member on the loopback address.
///
/// The certificate pair kept in the backup directory at join time is
/// reused; without one a fresh self-signed pair is minted.
async fn reinit_standalone_store(node: &AppState) -> Result<(), ClusterError> {
    node.consensus.reset_dir()?;
    if !node.consensus.restore_certs_from_backup()? {
        let (cert, key) = node.consensus.cert_paths();
        node.signer
            .generate_cluster_cert(&local_hostname()?, LOOPBACK, &cert, &key)
            .await?;
    }
    node.consensus
        .write_init(&[], &join_host_port(LOOPBACK, DEFAULT_CONSENSUS_PORT))
}

/// Put back the kubeconfigs the join replaced
fn restore_kubeconfigs(node: &AppState) -> Result<(), ClusterError> {
    for file in [layout::KUBELET_CONFIG, layout::PROXY_CONFIG] {
        if !files::restore_backup(&node.paths.data(file))? {
            tracing::debug!(file, "No kubeconfig backup to restore");
        }
    }
    Ok(())
}

async fn apply_cni(node: &AppState) -> Result<(), ClusterError> {
    let retry = &node.config.retry;
    cni::apply(
        node.kube.as_ref(),
        &node.paths,
        retry.cni_apply_attempts,
        retry.cni_apply_interval(),
    )
    .await
}
