//! Consensus store membership.
//!
//! Implements:
//! - Member listing through the store's CLI
//! - Idempotent member removal
//! - The sole-voter safety check used before leaving
//! - Bounded polling until the member list satisfies a condition

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use muster_common::{ClusterError, VoterSetEntry};

use crate::exec::CommandRunner;
use crate::paths::Paths;

/// Limit for one member list call
const LIST_TIMEOUT: Duration = Duration::from_secs(4);

#[async_trait]
pub trait MembershipAdapter: Send + Sync {
    async fn list_members(&self) -> Result<Vec<VoterSetEntry>, ClusterError>;

    /// Remove `address` from the store. Absent addresses are not an error.
    async fn remove_member(&self, address: &str) -> Result<(), ClusterError>;

    async fn is_sole_voter_with_dependents(
        &self,
        self_addresses: &[String],
    ) -> Result<bool, ClusterError> {
        let members = self.list_members().await?;
        Ok(sole_voter_with_dependents(&members, self_addresses))
    }
}

fn is_local(member: &VoterSetEntry, self_addresses: &[String]) -> bool {
    self_addresses.iter().any(|a| a == member.host())
}

/// Exactly one voter, it is us, and someone else depends on it
pub fn sole_voter_with_dependents(members: &[VoterSetEntry], self_addresses: &[String]) -> bool {
    let voters: Vec<&VoterSetEntry> = members.iter().filter(|m| m.is_voter()).collect();
    voters.len() == 1 && is_local(voters[0], self_addresses) && members.len() > 1
}

/// Split member addresses into ours and everybody else's
pub fn split_local(
    members: &[VoterSetEntry],
    self_addresses: &[String],
) -> (Vec<String>, Vec<String>) {
    members
        .iter()
        .map(|m| (is_local(m, self_addresses), m.address.clone()))
        .fold((Vec::new(), Vec::new()), |(mut mine, mut others), (local, addr)| {
            if local {
                mine.push(addr);
            } else {
                others.push(addr);
            }
            (mine, others)
        })
}

/// Member whose address is on `host`
pub fn member_on_host<'a>(members: &'a [VoterSetEntry], host: &str) -> Option<&'a VoterSetEntry> {
    members.iter().find(|m| m.host() == host)
}

/// Poll the member list until `done` holds.
///
/// Failed list calls count as attempts and wait `error_interval`.
pub async fn wait_for_members<F>(
    adapter: &dyn MembershipAdapter,
    attempts: u32,
    interval: Duration,
    error_interval: Duration,
    done: F,
) -> Result<Vec<VoterSetEntry>, ClusterError>
where
    F: Fn(&[VoterSetEntry]) -> bool + Send,
{
    let mut last_error = None;
    for attempt in 1..=attempts {
        match adapter.list_members().await {
            Ok(members) if done(&members) => return Ok(members),
            Ok(_) => {
                tracing::debug!(attempt, "Member list not ready yet");
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Member list unavailable");
                last_error = Some(e);
                tokio::time::sleep(error_interval).await;
            }
        }
    }
    Err(ClusterError::TransientNetwork(match last_error {
        Some(e) => format!("consensus store did not converge: {e}"),
        None => "consensus store did not converge".into(),
    }))
}

/// [`MembershipAdapter`] over the consensus store CLI
pub struct DqliteMembership {
    runner: Arc<dyn CommandRunner>,
    paths: Paths,
}

impl DqliteMembership {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: Paths) -> Self {
        Self { runner, paths }
    }

    fn command(&self, query: &str) -> Vec<String> {
        let backend = self.paths.backend();
        let backend = backend.to_string_lossy();
        vec![
            self.paths.consensus_cli().to_string_lossy().into_owned(),
            "-s".into(),
            format!("file://{backend}/cluster.yaml"),
            "-c".into(),
            format!("{backend}/cluster.crt"),
            "-k".into(),
            format!("{backend}/cluster.key"),
            "-f".into(),
            "json".into(),
            "k8s".into(),
            query.into(),
        ]
    }
}

#[async_trait]
impl MembershipAdapter for DqliteMembership {
    async fn list_members(&self) -> Result<Vec<VoterSetEntry>, ClusterError> {
        let out = tokio::time::timeout(LIST_TIMEOUT, self.runner.run(self.command(".cluster"), None))
            .await
            .map_err(|_| ClusterError::TransientNetwork("consensus store did not answer".into()))??;
        serde_json::from_str(&out)
            .map_err(|e| ClusterError::ExternalCommand(format!("unexpected member list: {e}")))
    }

    async fn remove_member(&self, address: &str) -> Result<(), ClusterError> {
        if address.contains("127.0.0.1") {
            tracing::warn!(address, "Refusing to remove a loopback member");
            return Ok(());
        }
        let members = self.list_members().await?;
        if !members.iter().any(|m| m.address == address) {
            tracing::debug!(address, "Member already absent");
            return Ok(());
        }
        self.runner
            .run(self.command(&format!(".remove {address}")), None)
            .await?;
        tracing::info!(address, "Consensus member removed");
        Ok(())
    }
}
