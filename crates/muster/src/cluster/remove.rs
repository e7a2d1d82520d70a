//! Removing another node from the cluster.

use muster_common::ClusterError;

use crate::membership::member_on_host;
use crate::state::AppState;

/// Forget `name` (node name or InternalIP).
///
/// Without `force`, a node that is still a consensus store member is
/// refused: it has to leave first.
pub async fn remove_node(node: &AppState, name: &str, force: bool) -> Result<(), ClusterError> {
    let found = node.kube.find_node(name).await?;
    let (node_name, address) = match &found {
        Some(info) => (
            info.name.clone(),
            info.internal_ip.clone().unwrap_or_else(|| name.to_string()),
        ),
        None => {
            tracing::warn!(node = name, "Node not found in the cluster, treating it as an address");
            (name.to_string(), name.to_string())
        }
    };

    if node.mode().is_consensus() {
        let members = node.membership.list_members().await?;
        if let Some(member) = member_on_host(&members, &address) {
            if !force {
                return Err(ClusterError::QuorumSafety(format!(
                    "Node {node_name} is still a consensus store member ({}). \
                     Run leave on it first, or use --force.",
                    member.address
                )));
            }
            node.membership.remove_member(&member.address).await?;
            tracing::info!(address = %member.address, "Removed from the consensus store");
        }
    }

    if node.token_auth_enabled()? && node.credentials.remove_kubelet_token(&node_name)? {
        tracing::debug!(node = %node_name, "Kubelet token revoked");
    }
    node.credentials.remove_callback_token(&address)?;
    if found.is_some() {
        node.kube.delete_node(&node_name).await?;
    }
    tracing::info!(node = %node_name, %address, "Node removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::NodeInfo;
    use crate::state::testing::TestNode;
    use muster_common::NodeRole::{Spare, Voter};
    use tokio_test::{assert_err, assert_ok};

    fn with_worker() -> TestNode {
        let node = TestNode::new();
        node.kube.nodes.lock().unwrap().push(NodeInfo {
            name: "worker-1".into(),
            internal_ip: Some("10.0.0.5".into()),
        });
        node.membership
            .set(&[("10.0.0.1:19001", Voter), ("10.0.0.5:19001", Spare)]);
        node.state.credentials.get_or_create_kubelet_token("worker-1").unwrap();
        node.state
            .credentials
            .store_peer_callback_token("10.0.0.5:25000", "peer-callback")
            .unwrap();
        node
    }

    #[tokio::test]
    async fn test_member_requires_force() {
        let node = with_worker();

        let err = assert_err!(remove_node(&node.state, "worker-1", false).await);
        assert!(matches!(err, ClusterError::QuorumSafety(_)));
        assert!(node.membership.removed().is_empty());
        assert!(node.kube.deleted().is_empty());

        assert_ok!(remove_node(&node.state, "10.0.0.5", true).await);
        assert_eq!(node.membership.removed(), vec!["10.0.0.5:19001"]);
        assert_eq!(node.kube.deleted(), vec!["worker-1"]);
        assert!(node.state.credentials.peer_callback_tokens().unwrap().is_empty());
        assert!(!node.read("credentials/known_tokens.csv").contains("system:node:worker-1"));
    }

    #[tokio::test]
    async fn test_non_member_is_removed_without_force() {
        let node = with_worker();
        node.membership.set(&[("10.0.0.1:19001", Voter)]);

        assert_ok!(remove_node(&node.state, "worker-1", false).await);
        assert_eq!(node.kube.deleted(), vec!["worker-1"]);
    }

    #[tokio::test]
    async fn test_unknown_node_falls_back_to_address() {
        let node = with_worker();
        *node.kube.nodes.lock().unwrap() = Vec::new();

        remove_node(&node.state, "10.0.0.5", true).await.unwrap();
        assert_eq!(node.membership.removed(), vec!["10.0.0.5:19001"]);
        assert!(node.kube.deleted().is_empty());
        assert!(node.state.credentials.peer_callback_tokens().unwrap().is_empty());
    }
}
