//! Host identity helpers.

use muster_common::ClusterError;

use crate::exec::CommandRunner;

/// Lowercased hostname of this machine
pub fn local_hostname() -> Result<String, ClusterError> {
    let name = hostname::get().map_err(|e| ClusterError::LocalState(format!("hostname: {e}")))?;
    Ok(name.to_string_lossy().to_lowercase())
}

/// Interface addresses reported by `hostname -I`
pub async fn local_addresses(runner: &dyn CommandRunner) -> Result<Vec<String>, ClusterError> {
    let out = runner.output(&["hostname", "-I"]).await?;
    Ok(out.split_whitespace().map(str::to_string).collect())
}

/// Addresses identifying this node in the member list
pub async fn self_addresses(runner: &dyn CommandRunner) -> Result<Vec<String>, ClusterError> {
    let mut addresses = local_addresses(runner).await?;
    if let Ok(name) = local_hostname() {
        addresses.push(name);
    }
    Ok(addresses)
}

/// Name other nodes should use to reach a joining node.
///
/// The hostname is used if it resolves, otherwise the address the
/// request came from.
pub async fn remote_host(hostname: &str, remote_ip: &str) -> String {
    if !hostname.is_empty() {
        if let Ok(mut addrs) = tokio::net::lookup_host((hostname, 0)).await {
            if addrs.next().is_some() {
                return hostname.to_string();
            }
        }
    }
    remote_ip.to_string()
}
