//! Wire payloads of the cluster agent HTTP API.
//!
//! Field names are a compatibility contract with nodes running older
//! releases, so several fields accept more than one JSON shape.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `POST /cluster/api/v1.0/join`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequestV1 {
    pub token: String,
    #[serde(default)]
    pub hostname: String,
    /// Cluster agent port of the joining node
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: String,
    /// Token the responder uses to call back into the joining node
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default)]
    pub can_handle_x509_auth: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinResponseV1 {
    pub ca: String,
    /// Replicated store client endpoint
    pub etcd: String,
    pub apiport: String,
    /// Token (or certificate request token) for kube-proxy
    pub kubeproxy: String,
    /// Token (or certificate request token) for the kubelet
    pub kubelet: String,
    pub kubelet_args: String,
    pub hostname_override: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,
    /// `Token` or `Cert`; absent means `Token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_authn_mode: Option<String>,
}

/// `POST /cluster/api/v2.0/join`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequestV2 {
    pub token: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: String,
    /// Join without running the control plane (`true` or `"as-worker"`)
    #[serde(default, deserialize_with = "worker_flag")]
    pub worker: bool,
    #[serde(default)]
    pub can_handle_x509_auth: bool,
    #[serde(default)]
    pub can_handle_custom_etcd: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinResponseV2 {
    pub ca: String,
    pub callback_token: String,
    pub apiport: String,
    pub kubelet_args: String,
    pub hostname_override: String,
    /// Consensus voters as `address:port`; empty for workers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub voters: Vec<String>,
    #[serde(default)]
    pub service_account_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    /// Always present on the wire; `null` for worker joins
    #[serde(default)]
    pub ca_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_key: Option<String>,
    /// API server addresses a worker proxies to
    #[serde(default)]
    pub control_plane_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_authz_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_servers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_key: Option<String>,
}

/// `POST /cluster/api/v1.0/sign-cert`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignCertRequest {
    pub token: String,
    /// CSR in PEM format
    pub request: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignCertResponse {
    pub certificate: String,
}

/// `POST /cluster/api/v1.0/configure`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureRequest {
    pub callback: String,
    #[serde(default)]
    pub service: Vec<ConfigureService>,
    #[serde(default)]
    pub addon: Vec<ConfigureAddon>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureService {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments_update: Vec<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments_remove: Vec<String>,
    /// `true` or `"yes"`
    #[serde(default, deserialize_with = "restart_flag")]
    pub restart: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureAddon {
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub disable: bool,
}

/// `POST /cluster/api/v1.0/upgrade`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeRequest {
    #[serde(default)]
    pub callback: String,
    /// Directory under `upgrade-scripts`, e.g. `003-calico-3-19-3`
    #[serde(default)]
    pub upgrade: String,
    /// `prepare`, `commit` or `rollback`
    #[serde(default)]
    pub phase: String,
}

/// Body of the callback-authenticated read endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackRequest {
    #[serde(default)]
    pub callback: String,
}

/// Body of `/service/*`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRequest {
    #[serde(default)]
    pub callback: String,
    #[serde(default)]
    pub service: String,
}

/// Body of `/addon/*`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddonRequest {
    #[serde(default)]
    pub callback: String,
    #[serde(default)]
    pub addon: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Error class, see [`ClusterError::kind`](crate::ClusterError::kind)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub result: String,
}

impl ResultResponse {
    pub fn ok() -> Self {
        Self {
            result: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub enabled: bool,
    pub active: bool,
}

fn flag<'de, D>(deserializer: D, accepted: &str) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s == accepted,
        _ => false,
    })
}

/// `true` or `"as-worker"`; anything else is false
pub fn worker_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    flag(deserializer, "as-worker")
}

/// `true` or `"yes"`; anything else is false
pub fn restart_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    flag(deserializer, "yes")
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}
