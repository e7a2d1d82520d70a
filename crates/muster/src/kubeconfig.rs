//! Client kubeconfig files written when a node joins.

use serde::Serialize;
use std::path::Path;

use muster_common::ClusterError;

/// How a kubeconfig user authenticates
#[derive(Debug, Clone)]
pub enum ClientAuth<'a> {
    Token(&'a str),
    Certificate { cert: &'a Path, key: &'a Path },
}

#[derive(Serialize)]
struct Kubeconfig<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: [Named<'a, Cluster>; 1],
    contexts: [Named<'a, Context<'a>>; 1],
    #[serde(rename = "current-context")]
    current_context: &'a str,
    users: [Named<'a, User>; 1],
}

#[derive(Serialize)]
struct Named<'a, T> {
    name: &'a str,
    #[serde(flatten)]
    inner: T,
}

#[derive(Serialize)]
struct Cluster {
    cluster: ClusterSpec,
}

#[derive(Serialize)]
struct ClusterSpec {
    #[serde(rename = "certificate-authority")]
    certificate_authority: String,
    server: String,
}

#[derive(Serialize)]
struct Context<'a> {
    context: ContextSpec<'a>,
}

#[derive(Serialize)]
struct ContextSpec<'a> {
    cluster: &'a str,
    user: &'a str,
}

#[derive(Serialize)]
struct User {
    user: UserSpec,
}

#[derive(Serialize, Default)]
struct UserSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(rename = "client-certificate", skip_serializing_if = "Option::is_none")]
    client_certificate: Option<String>,
    #[serde(rename = "client-key", skip_serializing_if = "Option::is_none")]
    client_key: Option<String>,
}

/// Render a single-cluster kubeconfig for `user` against `server`
pub fn render(
    user: &str,
    server: &str,
    ca_file: &Path,
    auth: ClientAuth<'_>,
) -> Result<String, ClusterError> {
    let user_spec = match auth {
        ClientAuth::Token(token) => UserSpec {
            token: Some(token.to_string()),
            ..UserSpec::default()
        },
        ClientAuth::Certificate { cert, key } => UserSpec {
            client_certificate: Some(cert.to_string_lossy().into_owned()),
            client_key: Some(key.to_string_lossy().into_owned()),
            ..UserSpec::default()
        },
    };

    let config = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: [Named {
            name: "microk8s-cluster",
            inner: Cluster {
                cluster: ClusterSpec {
                    certificate_authority: ca_file.to_string_lossy().into_owned(),
                    server: format!("https://{server}"),
                },
            },
        }],
        contexts: [Named {
            name: "microk8s",
            inner: Context {
                context: ContextSpec {
                    cluster: "microk8s-cluster",
                    user,
                },
            },
        }],
        current_context: "microk8s",
        users: [Named {
            name: user,
            inner: User { user: user_spec },
        }],
    };
    serde_yaml::to_string(&config).map_err(|e| ClusterError::Internal(format!("kubeconfig: {e}")))
}
