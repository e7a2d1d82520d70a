//! Join endpoints.
//!
//! Implements:
//! - v1: workers joining a node that runs the legacy replicated store
//! - v2: control plane and worker nodes joining the consensus store

use axum::{Json, extract::State};

use muster_common::api::{JoinRequestV1, JoinRequestV2, JoinResponseV1, JoinResponseV2};
use muster_common::constants::{
    KUBELET_CERT_TOKEN_SUFFIX, PROXY_CERT_TOKEN_SUFFIX, args as arg, files as layout, locks,
};
use muster_common::{ClusterError, ClusterMode, VoterSetEntry, join_host_port};

use super::error::{ApiResult, JsonBody, RequestOrigin};
use crate::cni;
use crate::membership::wait_for_members;
use crate::network::remote_host;
use crate::state::AppState;
use crate::store::TokenKind;

const LOOPBACK: &str = "127.0.0.1";

pub async fn join_v1(
    State(state): State<AppState>,
    origin: RequestOrigin,
    JsonBody(request): JsonBody<JoinRequestV1>,
) -> ApiResult<JoinResponseV1> {
    Ok(Json(respond_v1(&state, &origin, request).await?))
}

pub async fn join_v2(
    State(state): State<AppState>,
    origin: RequestOrigin,
    JsonBody(request): JsonBody<JoinRequestV2>,
) -> ApiResult<JoinResponseV2> {
    Ok(Json(respond_v2(&state, &origin, request).await?))
}

fn consume_join_token(state: &AppState, token: &str) -> Result<(), ClusterError> {
    if !state.credentials.validate_and_consume(TokenKind::Bootstrap, token)? {
        return Err(ClusterError::Authentication("Invalid token".into()));
    }
    Ok(())
}

fn require_auth_support(state: &AppState, can_handle_x509_auth: bool) -> Result<bool, ClusterError> {
    let token_auth = state.token_auth_enabled()?;
    if !token_auth && !can_handle_x509_auth {
        return Err(ClusterError::Compatibility(
            "The cluster uses certificate authentication. Upgrade the joining node to a newer version."
                .into(),
        ));
    }
    Ok(token_auth)
}

/// Kubelet arguments for the joiner, pinning its node name when it
/// is reached by address rather than by hostname
fn kubelet_args_for(state: &AppState, host: &str, hostname: &str) -> Result<String, ClusterError> {
    let mut kubelet_args = state.args.read("kubelet")?;
    if host != hostname {
        if !kubelet_args.is_empty() && !kubelet_args.ends_with('\n') {
            kubelet_args.push('\n');
        }
        kubelet_args.push_str(&format!("{}={host}\n", arg::HOSTNAME_OVERRIDE));
    }
    Ok(kubelet_args)
}

pub async fn respond_v1(
    state: &AppState,
    origin: &RequestOrigin,
    request: JoinRequestV1,
) -> Result<JoinResponseV1, ClusterError> {
    consume_join_token(state, &request.token)?;

    if state.mode().is_consensus() {
        return Err(ClusterError::Compatibility(
            "This node runs the consensus store. Upgrade the joining node to a newer version.".into(),
        ));
    }
    let token_auth = require_auth_support(state, request.can_handle_x509_auth)?;

    // The joiner requests its replicated store client certificate with the same token
    state.credentials.add_certificate_request_token(&request.token)?;

    let host = remote_host(&request.hostname, &origin.remote_ip).await;
    if let Some(callback) = request.callback.as_deref().filter(|c| !c.is_empty()) {
        state
            .credentials
            .store_peer_callback_token(&join_host_port(&host, &request.port), callback)?;
    }

    let ca = state.ca_cert()?;
    let (kubeproxy, kubelet, authn) = if token_auth {
        let kubeproxy = state
            .credentials
            .get_known_token("system:kube-proxy")?
            .ok_or_else(|| ClusterError::LocalState("kube-proxy token is missing".into()))?;
        let kubelet = state.credentials.get_or_create_kubelet_token(&host)?;
        state.services.restart("kube-apiserver").await?;
        (kubeproxy, kubelet, "Token")
    } else {
        let kubeproxy = format!("{}{PROXY_CERT_TOKEN_SUFFIX}", request.token);
        let kubelet = format!("{}{KUBELET_CERT_TOKEN_SUFFIX}", request.token);
        state.credentials.add_certificate_request_token(&kubeproxy)?;
        state.credentials.add_certificate_request_token(&kubelet)?;
        (kubeproxy, kubelet, "Cert")
    };

    let kubelet_args = kubelet_args_for(state, &host, &request.hostname)?;
    state.locks.create(locks::NO_CERT_REISSUE)?;

    let etcd = state
        .args
        .get("etcd", "--listen-client-urls")?
        .ok_or_else(|| ClusterError::LocalState("etcd client URL is not configured".into()))?;

    tracing::info!(host = %host, authn, "Legacy worker joined");
    Ok(JoinResponseV1 {
        ca,
        etcd,
        apiport: state.api_port()?,
        kubeproxy,
        kubelet,
        kubelet_args,
        hostname_override: host,
        cluster_cidr: state.args.get("kube-proxy", arg::CLUSTER_CIDR)?,
        api_authn_mode: Some(authn.to_string()),
    })
}

pub async fn respond_v2(
    state: &AppState,
    origin: &RequestOrigin,
    request: JoinRequestV2,
) -> Result<JoinResponseV2, ClusterError> {
    consume_join_token(state, &request.token)?;

    match state.mode() {
        ClusterMode::ConsensusControlPlane => {}
        ClusterMode::ConsensusWorker => {
            return Err(ClusterError::Compatibility(
                "This node is a worker. Join through one of the control plane nodes.".into(),
            ));
        }
        _ => {
            return Err(ClusterError::Compatibility(
                "Not possible to join. This is not an HA cluster.".into(),
            ));
        }
    }

    let agent_port = state.agent_port()?;
    if agent_port != request.port {
        return Err(ClusterError::Compatibility(format!(
            "The cluster agent port needs to be set to {agent_port}."
        )));
    }
    let token_auth = require_auth_support(state, request.can_handle_x509_auth)?;

    let etcd_servers = state.args.get("kube-apiserver", arg::ETCD_SERVERS)?;
    if etcd_servers.is_some() && !request.can_handle_custom_etcd {
        return Err(ClusterError::Compatibility(
            "The cluster uses an external datastore. Upgrade the joining node to a newer version."
                .into(),
        ));
    }

    let host = remote_host(&request.hostname, &origin.remote_ip).await;
    let mut members = Vec::new();
    if etcd_servers.is_none() {
        members = state.membership.list_members().await?;
        if members.iter().any(|m| m.host() == host) {
            return Err(ClusterError::Compatibility(format!(
                "The joining node ({host}) is already known to the datastore."
            )));
        }
        if members.len() == 1 && members[0].host() == LOOPBACK {
            members = move_off_loopback(state, &origin.host).await?;
        }
    }

    let callback_token = state.credentials.get_or_create_self_callback_token()?;
    state
        .credentials
        .store_peer_callback_token(&join_host_port(&host, &request.port), &callback_token)?;

    let ca = state.ca_cert()?;
    let kubelet_args = kubelet_args_for(state, &host, &request.hostname)?;

    // Calico on this node should detect the interface that reaches the joiner
    if cni::patch_autodetect(&state.paths, &host)? {
        let manifest = state.paths.data(layout::CNI_MANIFEST);
        state.kube.apply_manifest(&manifest).await?;
    }
    state.locks.create(locks::NO_CERT_REISSUE)?;

    let mut response = JoinResponseV2 {
        ca,
        callback_token,
        apiport: state.api_port()?,
        kubelet_args,
        hostname_override: host.clone(),
        cluster_cidr: state.args.get("kube-proxy", arg::CLUSTER_CIDR)?,
        api_authz_mode: state.args.get("kube-apiserver", arg::AUTHORIZATION_MODE)?,
        ..JoinResponseV2::default()
    };

    if request.worker {
        let token = request.token.trim();
        state
            .credentials
            .add_certificate_request_token(&format!("{token}{KUBELET_CERT_TOKEN_SUFFIX}"))?;
        state
            .credentials
            .add_certificate_request_token(&format!("{token}{PROXY_CERT_TOKEN_SUFFIX}"))?;
        response.control_plane_nodes = control_plane_nodes(state, &members).await;
        tracing::info!(host = %host, "Worker joined");
        return Ok(response);
    }

    response.ca_key = Some(state.read_data(layout::CA_KEY)?);
    response.service_account_key = state.read_data(layout::SERVICE_ACCOUNT_KEY)?;
    if token_auth {
        response.admin_token = state.credentials.get_known_token("admin")?;
    }

    match etcd_servers {
        Some(servers) => {
            let read_arg_file = |key: &str| -> Result<Option<String>, ClusterError> {
                match state.args.get("kube-apiserver", key)? {
                    Some(path) => {
                        let path = path.replace("${SNAP_DATA}", &state.paths.data_root().to_string_lossy());
                        Ok(Some(crate::store::files::read_required(std::path::Path::new(&path))?))
                    }
                    None => Ok(None),
                }
            };
            response.etcd_ca = read_arg_file(arg::ETCD_CAFILE)?;
            response.etcd_cert = read_arg_file(arg::ETCD_CERTFILE)?;
            response.etcd_key = read_arg_file(arg::ETCD_KEYFILE)?;
            response.etcd_servers = Some(servers);
        }
        None => {
            response.cluster_cert = Some(state.consensus.cluster_cert()?);
            response.cluster_key = Some(state.consensus.cluster_key()?);
            response.voters = members
                .iter()
                .filter(|m| m.is_voter())
                .map(|m| m.address.clone())
                .collect();
        }
    }

    tracing::info!(host = %host, voters = response.voters.len(), "Control plane node joined");
    Ok(response)
}

/// The first node starts bound to loopback; rebind it to the address
/// peers reach it on before handing out the voter set
async fn move_off_loopback(
    state: &AppState,
    host: &str,
) -> Result<Vec<VoterSetEntry>, ClusterError> {
    if host.is_empty() {
        return Err(ClusterError::InvalidInput("request has no Host header".into()));
    }
    let address = state.consensus.write_update(host)?;
    tracing::info!(%address, "Moving the datastore off the loopback address");
    state.services.restart("k8s-dqlite").await?;
    state.services.restart("kube-apiserver").await?;

    let retry = &state.config.retry;
    wait_for_members(
        state.membership.as_ref(),
        retry.first_node_wait_attempts,
        retry.first_node_wait_interval(),
        retry.consensus_error_interval(),
        |members| !members.is_empty() && members.iter().all(|m| m.host() != LOOPBACK),
    )
    .await
}

/// API server addresses of the voters, by node InternalIP where known
async fn control_plane_nodes(state: &AppState, members: &[VoterSetEntry]) -> Vec<String> {
    let nodes = match state.kube.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot list nodes for the worker proxy");
            Vec::new()
        }
    };
    members
        .iter()
        .filter(|m| m.is_voter())
        .map(|m| {
            nodes
                .iter()
                .find(|n| n.name == m.host() || n.internal_ip.as_deref() == Some(m.host()))
                .and_then(|n| n.internal_ip.clone())
                .unwrap_or_else(|| m.host().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestNode;
    use muster_common::NodeRole::{StandBy, Voter};

    const TOKEN: &str = "abcdef0123456789abcdef0123456789";

    fn origin() -> RequestOrigin {
        RequestOrigin {
            remote_ip: "10.0.0.2".into(),
            host: "10.0.0.1".into(),
        }
    }

    fn v2_request(worker: bool) -> JoinRequestV2 {
        JoinRequestV2 {
            token: TOKEN.into(),
            hostname: String::new(),
            port: "25000".into(),
            worker,
            can_handle_x509_auth: true,
            can_handle_custom_etcd: false,
        }
    }

    #[tokio::test]
    async fn test_first_join_moves_store_off_loopback() {
        let node = TestNode::new();
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        // Restarting the store makes it report its new address
        node.membership.then(&[("10.0.0.1:19001", Voter)]);

        let response = respond_v2(&node.state, &origin(), v2_request(false)).await.unwrap();
        assert_eq!(response.voters, vec!["10.0.0.1:19001"]);
        assert!(node.read("var/kubernetes/backend/update.yaml").contains("10.0.0.1:19001"));
        assert_eq!(node.runner.calls_matching("snapctl restart").len(), 2);
    }

    #[tokio::test]
    async fn test_control_plane_join_returns_cluster_material() {
        let node = TestNode::new();
        // A member sharing the joiner's address as a prefix is a different host
        node.membership.set(&[("10.0.0.1:19001", Voter), ("10.0.0.20:19001", StandBy)]);
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();

        let response = respond_v2(&node.state, &origin(), v2_request(false)).await.unwrap();
        assert_eq!(response.ca, "CA CERT\n");
        assert_eq!(response.ca_key.as_deref(), Some("CA KEY\n"));
        assert_eq!(response.admin_token.as_deref(), Some("admintoken"));
        assert_eq!(response.cluster_cert.as_deref(), Some("LOCAL CLUSTER CERT\n"));
        assert_eq!(response.voters, vec!["10.0.0.1:19001"]);
        assert_eq!(response.hostname_override, "10.0.0.2");
        assert!(response.kubelet_args.ends_with("--hostname-override=10.0.0.2\n"));
        assert!(node.state.locks.has(locks::NO_CERT_REISSUE));
        assert!(node.read(layout::CNI_MANIFEST).contains("can-reach=10.0.0.2"));
        assert_eq!(node.kube.applied().len(), 1);
        assert!(node.read(layout::CALLBACK_TOKENS).starts_with("10.0.0.2:25000 "));

        // Scenario A: the token was consumed by the first join
        let err = respond_v2(&node.state, &origin(), v2_request(false)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Authentication(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_worker_join_gets_no_ca_key() {
        let node = TestNode::new();
        node.membership.set(&[("10.0.0.1:19001", Voter)]);
        node.kube.nodes.lock().unwrap().push(crate::kube::NodeInfo {
            name: "10.0.0.1".into(),
            internal_ip: Some("192.168.1.1".into()),
        });
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();

        let response = respond_v2(&node.state, &origin(), v2_request(true)).await.unwrap();
        assert!(response.ca_key.is_none());
        assert!(response.voters.is_empty());
        assert_eq!(response.control_plane_nodes, vec!["192.168.1.1"]);
        let kubelet_token = format!("{TOKEN}-kubelet");
        assert!(node
            .state
            .credentials
            .validate_and_consume(TokenKind::CertificateRequest, &kubelet_token)
            .unwrap());
    }

    #[tokio::test]
    async fn test_v2_refusals() {
        let node = TestNode::new();
        node.membership.set(&[("10.0.0.1:19001", Voter), ("10.0.0.2:19001", Voter)]);

        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let err = respond_v2(&node.state, &origin(), v2_request(false)).await.unwrap_err();
        assert!(err.to_string().contains("already known"), "{err}");
        assert!(matches!(err, ClusterError::Compatibility(_)));

        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let mut request = v2_request(false);
        request.port = "25001".into();
        let err = respond_v2(&node.state, &origin(), request).await.unwrap_err();
        assert_eq!(err.to_string(), "The cluster agent port needs to be set to 25000.");

        node.disable_token_auth();
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let mut request = v2_request(true);
        request.can_handle_x509_auth = false;
        let err = respond_v2(&node.state, &origin(), request).await.unwrap_err();
        assert!(matches!(err, ClusterError::Compatibility(_)));

        node.state.locks.mark_worker().unwrap();
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let err = respond_v2(&node.state, &origin(), v2_request(true)).await.unwrap_err();
        assert!(err.to_string().contains("worker"));
    }

    #[tokio::test]
    async fn test_external_datastore_requires_capable_joiner() {
        let node = TestNode::new();
        node.write("certs/etcd-ca.crt", "ETCD CA");
        node.state
            .args
            .update(
                "kube-apiserver",
                &[
                    (arg::ETCD_SERVERS.into(), "https://10.0.0.5:2379".into()),
                    (arg::ETCD_CAFILE.into(), "${SNAP_DATA}/certs/etcd-ca.crt".into()),
                ],
                &[],
            )
            .unwrap();

        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let err = respond_v2(&node.state, &origin(), v2_request(false)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Compatibility(_)));

        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let mut request = v2_request(false);
        request.can_handle_custom_etcd = true;
        let response = respond_v2(&node.state, &origin(), request).await.unwrap();
        assert_eq!(response.etcd_servers.as_deref(), Some("https://10.0.0.5:2379"));
        assert_eq!(response.etcd_ca.as_deref(), Some("ETCD CA"));
        assert!(response.etcd_cert.is_none());
        assert!(response.cluster_cert.is_none());
    }

    #[tokio::test]
    async fn test_v1_join_token_and_cert_modes() {
        let node = TestNode::new();
        node.state.locks.remove(locks::HA_CLUSTER).unwrap();
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();

        let request = JoinRequestV1 {
            token: TOKEN.into(),
            hostname: String::new(),
            port: "25000".into(),
            callback: Some("CALLBACK".into()),
            can_handle_x509_auth: true,
        };
        let response = respond_v1(&node.state, &origin(), request.clone()).await.unwrap();
        assert_eq!(response.api_authn_mode.as_deref(), Some("Token"));
        assert_eq!(response.kubeproxy, "proxytoken");
        assert_eq!(response.kubelet.len(), 32);
        assert_eq!(response.etcd, "https://0.0.0.0:12379");
        assert_eq!(response.apiport, "16443");
        assert_eq!(response.cluster_cidr.as_deref(), Some("10.1.0.0/16"));
        assert_eq!(node.read(layout::CALLBACK_TOKENS), "10.0.0.2:25000 CALLBACK\n");
        assert!(node.read(layout::KNOWN_TOKENS).contains("system:node:10.0.0.2"));
        // The same token now authorises the store client certificate
        assert!(node
            .state
            .credentials
            .is_valid(TokenKind::CertificateRequest, TOKEN)
            .unwrap());

        node.disable_token_auth();
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let response = respond_v1(&node.state, &origin(), request).await.unwrap();
        assert_eq!(response.api_authn_mode.as_deref(), Some("Cert"));
        assert_eq!(response.kubelet, format!("{TOKEN}-kubelet"));
    }

    #[tokio::test]
    async fn test_v1_refused_in_consensus_mode() {
        let node = TestNode::new();
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();
        let request = JoinRequestV1 {
            token: TOKEN.into(),
            ..JoinRequestV1::default()
        };
        let err = respond_v1(&node.state, &origin(), request).await.unwrap_err();
        assert!(matches!(err, ClusterError::Compatibility(_)));
    }
}
