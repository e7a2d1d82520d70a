//! Bootstrap tokens and the join strings printed for them.

use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

use muster_common::constants::{FINGERPRINT_MIN_LEN, files as layout};
use muster_common::{ClusterError, join_host_port};

use crate::certs::certificate_fingerprint;
use crate::network::local_addresses;
use crate::state::AppState;

/// Output style of `add-token`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TokenFormat {
    /// One join command per address
    Short,
    /// Join commands with instructions
    Long,
    /// The bare token
    Token,
    Json,
}

/// A freshly issued token and the connection strings that redeem it
#[derive(Debug, Clone, Serialize)]
pub struct JoinStrings {
    pub token: String,
    /// `host:port/token/fingerprint`, one per local address
    pub urls: Vec<String>,
    pub fingerprint: String,
}

impl JoinStrings {
    pub fn render(&self, format: TokenFormat) -> Result<String, ClusterError> {
        let mut out = String::new();
        match format {
            TokenFormat::Token => out.push_str(&self.token),
            TokenFormat::Json => {
                out = serde_json::to_string(self)
                    .map_err(|e| ClusterError::Internal(format!("token output: {e}")))?;
            }
            TokenFormat::Short => {
                for url in &self.urls {
                    let _ = writeln!(out, "muster join {url}");
                }
            }
            TokenFormat::Long => {
                out.push_str("From the node you wish to join to this cluster, run the following:\n");
                if let Some(first) = self.urls.first() {
                    let _ = writeln!(out, "muster join {first}\n");
                    out.push_str("Use the '--worker' flag to join a node as a worker not running the control plane, eg:\n");
                    let _ = writeln!(out, "muster join {first} --worker\n");
                }
                if self.urls.len() > 1 {
                    out.push_str("If the node you are adding is not reachable through the default interface you can use one of the following:\n");
                    for url in &self.urls {
                        let _ = writeln!(out, "muster join {url}");
                    }
                }
            }
        }
        Ok(out.trim_end().to_string())
    }
}

/// Issue a bootstrap token and build the join strings for this node.
///
/// `ttl = None` issues a single-use token.
pub async fn add_token(
    node: &AppState,
    ttl: Option<Duration>,
    token: Option<String>,
) -> Result<JoinStrings, ClusterError> {
    let fingerprint = certificate_fingerprint(&node.paths.data(layout::SERVER_CERT))?;
    let fingerprint = fingerprint
        .get(..FINGERPRINT_MIN_LEN)
        .unwrap_or(&fingerprint)
        .to_string();
    let port = node.agent_port()?;
    let addresses = local_addresses(node.runner.as_ref()).await?;

    let token = node.credentials.issue_bootstrap_token(ttl, token)?;
    let urls = addresses
        .iter()
        .map(|address| format!("{}/{token}/{fingerprint}", join_host_port(address, &port)))
        .collect();
    Ok(JoinStrings {
        token,
        urls,
        fingerprint,
    })
}
