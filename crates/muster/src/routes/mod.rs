//! HTTP route handlers for the cluster agent.

use axum::{
    Router,
    http::Uri,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use muster_common::ClusterError;
use muster_common::constants::{CLUSTER_API_V1, CLUSTER_API_V2};

use crate::state::AppState;

mod configure;
mod error;
mod health;
mod join;
mod ops;
mod sign_cert;

pub use configure::apply as apply_configuration;
use error::ApiError;

/// Create the agent router.
///
/// Requests are handled one at a time across all routes, so handlers
/// mutate node files without further coordination.
pub fn create_router(state: AppState) -> Router {
    let request_timeout = state.config.request_timeout();

    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Cluster API
        .nest(CLUSTER_API_V1, v1_routes())
        .nest(CLUSTER_API_V2, v2_routes())

        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(GlobalConcurrencyLimitLayer::new(1)),
        )
        .with_state(state)
}

/// Legacy join, signing, configuration and operational endpoints
fn v1_routes() -> Router<AppState> {
    Router::new()
        .route("/join", post(join::join_v1))
        .route("/sign-cert", post(sign_cert::sign_cert))
        .route("/configure", post(configure::configure))
        .route("/upgrade", post(ops::upgrade))
        .route("/version", post(ops::version))
        .route("/status", post(ops::status))
        .route("/services", post(ops::services))
        .route("/overview", post(ops::overview))
        .route("/config", post(ops::config))
        .route("/service/{action}", post(ops::service))
        .route("/addon/{action}", post(ops::addon))
}

/// Consensus store join
fn v2_routes() -> Router<AppState> {
    Router::new().route("/join", post(join::join_v2))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError(ClusterError::NotFound(format!("no route for {}", uri.path())))
}

/// Check the callback token presented to an operational endpoint
fn require_callback(state: &AppState, token: &str) -> Result<(), ClusterError> {
    if !state.credentials.is_valid_self_callback_token(token)? {
        return Err(ClusterError::Authentication("Invalid callback token".into()));
    }
    Ok(())
}

/// Check that a name taken from a request is a single path component
fn path_component<'a>(field: &str, value: &'a str) -> Result<&'a str, ClusterError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ClusterError::InvalidInput(format!("{field} must be specified")));
    }
    if value == "." || value.contains("..") || value.contains(['/', '\\']) {
        return Err(ClusterError::InvalidInput(format!("invalid {field} {value:?}")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestNode;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use muster_common::NodeRole::Voter;
    use muster_common::constants::files as layout;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    const TOKEN: &str = "abcdef0123456789abcdef0123456789";

    async fn post_json(node: &TestNode, path: &str, body: &str) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header("host", "10.0.0.1:25000")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("10.0.0.2:40000".parse::<SocketAddr>().unwrap()));

        let response = create_router(node.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn callback(node: &TestNode) -> String {
        node.state.credentials.get_or_create_self_callback_token().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_route_and_bad_json() {
        let node = TestNode::new();
        let (status, body) = post_json(&node, "/cluster/api/v3.0/join", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, body) = post_json(&node, "/cluster/api/v2.0/join", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid request body"));
    }

    #[tokio::test]
    async fn test_join_token_is_single_use() {
        let node = TestNode::new();
        node.membership.set(&[("10.0.0.1:19001", Voter)]);
        node.state.credentials.issue_bootstrap_token(None, Some(TOKEN.into())).unwrap();

        let body = json!({"token": TOKEN, "hostname": "", "port": 25000, "worker": "as-worker",
                          "can_handle_x509_auth": true})
        .to_string();
        let (status, first) = post_json(&node, "/cluster/api/v2.0/join", &body).await;
        assert_eq!(status, StatusCode::OK, "{first}");
        assert!(first["ca_key"].is_null());
        assert_eq!(first["hostname_override"], "10.0.0.2");

        let (status, second) = post_json(&node, "/cluster/api/v2.0/join", &body).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(second["error"], "Invalid token");
        assert_eq!(second["kind"], "authentication");
    }

    #[tokio::test]
    async fn test_sign_cert_consumes_request_token() {
        let node = TestNode::new();
        node.state.credentials.add_certificate_request_token("req-token").unwrap();
        let body = json!({"token": "req-token", "request": "CSR"}).to_string();

        let (status, signed) = post_json(&node, "/cluster/api/v1.0/sign-cert", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert!(signed["certificate"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
        assert_eq!(node.runner.inputs(), vec![b"CSR".to_vec()]);

        let (status, _) = post_json(&node, "/cluster/api/v1.0/sign-cert", &body).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_configure_removes_argument_and_restarts_on_request() {
        let node = TestNode::new();
        node.write("args/kube-proxy", "--cluster-cidr=10.1.0.0/16\n--bad-flag=1\n");
        let token = callback(&node);

        let body = json!({"callback": token,
                          "service": [{"name": "kube-proxy", "arguments_remove": ["--bad-flag"]}]})
        .to_string();
        let (status, result) = post_json(&node, "/cluster/api/v1.0/configure", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["result"], "ok");
        assert!(!node.read("args/kube-proxy").lines().any(|l| l.starts_with("--bad-flag")));
        assert!(node.runner.calls_matching("snapctl restart").is_empty());

        let body = json!({"callback": token,
                          "service": [{"name": "kube-proxy",
                                       "arguments_update": [{"--v": "2"}],
                                       "restart": "yes"}],
                          "addon": [{"name": "dns", "enable": true}]})
        .to_string();
        let (status, _) = post_json(&node, "/cluster/api/v1.0/configure", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert!(node.read("args/kube-proxy").contains("--v=2\n"));
        assert_eq!(
            node.runner.calls_matching("snapctl restart"),
            vec!["snapctl restart microk8s.daemon-proxy"]
        );
        assert_eq!(node.runner.calls_matching("microk8s-enable.wrapper dns").len(), 1);

        let body = json!({"callback": "wrong", "service": []}).to_string();
        let (status, _) = post_json(&node, "/cluster/api/v1.0/configure", &body).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_configure_rejects_service_paths() {
        let node = TestNode::new();
        let token = callback(&node);

        for name in ["../certs/ca.key", "kubelet/x", ".."] {
            let body = json!({"callback": token,
                              "service": [{"name": "kube-proxy", "arguments_update": [{"--v": "2"}]},
                                          {"name": name, "arguments_remove": ["--x"]}]})
            .to_string();
            let (status, body) = post_json(&node, "/cluster/api/v1.0/configure", &body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{name}");
            assert_eq!(body["kind"], "invalid_input");
        }
        // Nothing is applied when any name is rejected
        assert!(!node.read("args/kube-proxy").contains("--v=2"));
        assert!(node.exists(layout::CA_KEY));
    }

    #[tokio::test]
    async fn test_upgrade_runs_phase_script() {
        let node = TestNode::new();
        let token = callback(&node);
        node.write_snap("upgrade-scripts/003-calico-3-19-3/prepare-node.sh", "#!/bin/sh\n");

        let upgrade = |phase: &str, name: &str| {
            json!({"callback": token, "upgrade": name, "phase": phase}).to_string()
        };

        let (status, body) = post_json(&node, "/cluster/api/v1.0/upgrade",
            &upgrade("prepare", "003-calico-3-19-3")).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["result"], "ok");
        assert_eq!(node.runner.calls_matching("003-calico-3-19-3/prepare-node.sh").len(), 1);

        let (status, body) = post_json(&node, "/cluster/api/v1.0/upgrade",
            &upgrade("apply", "003-calico-3-19-3")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("unknown upgrade phase"));

        let (status, _) = post_json(&node, "/cluster/api/v1.0/upgrade",
            &upgrade("commit", "003-calico-3-19-3")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post_json(&node, "/cluster/api/v1.0/upgrade",
            &upgrade("prepare", "../../bin")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_json(&node, "/cluster/api/v1.0/upgrade",
            &json!({"callback": "wrong", "upgrade": "003-calico-3-19-3", "phase": "prepare"})
                .to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(node.runner.calls_matching("-node.sh").len(), 1);
    }

    #[tokio::test]
    async fn test_operational_endpoints_check_callback_then_fields() {
        let node = TestNode::new();
        let token = callback(&node);

        let (status, _) = post_json(&node, "/cluster/api/v1.0/service/restart",
            &json!({"callback": "wrong", "service": ""}).to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, body) = post_json(&node, "/cluster/api/v1.0/service/restart",
            &json!({"callback": token, "service": ""}).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "service must be specified");

        let (status, body) = post_json(&node, "/cluster/api/v1.0/service/stop",
            &json!({"callback": token, "service": "kubelet"}).to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "ok");
        assert_eq!(node.runner.calls_matching("snapctl stop"), vec!["snapctl stop microk8s.daemon-kubelet"]);

        node.runner.respond("journalctl", "line 1\nline 2\n");
        let (_, body) = post_json(&node, "/cluster/api/v1.0/service/logs",
            &json!({"callback": token, "service": "kubelet"}).to_string()).await;
        assert_eq!(body["logs"], "line 1\nline 2\n");

        let (status, _) = post_json(&node, "/cluster/api/v1.0/addon/enable",
            &json!({"callback": token}).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = post_json(&node, "/cluster/api/v1.0/version",
            &json!({"callback": token}).to_string()).await;
        assert_eq!(body["mode"], "consensus-control-plane");

        let (status, body) = post_json(&node, "/cluster/api/v1.0/config",
            &json!({"callback": token}).to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "Config");
        assert!(node.exists(layout::CLIENT_CONFIG));
    }
}
