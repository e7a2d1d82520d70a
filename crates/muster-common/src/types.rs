//! Core types shared across Muster components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::constants::TOKEN_MIN_LEN;
use crate::error::ClusterError;

/// Cluster mode of a node, derived from its lock files.
///
/// - `Single`: standalone node speaking the legacy join protocol
/// - `LegacyReplicated`: worker joined to a legacy replicated-store control plane
/// - `ConsensusControlPlane`: voter (or would-be voter) of the consensus store
/// - `ConsensusWorker`: consensus cluster member running no control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    Single,
    LegacyReplicated,
    ConsensusControlPlane,
    ConsensusWorker,
}

impl ClusterMode {
    /// Resolve the mode from lock file presence
    pub fn from_locks(ha_cluster: bool, clustered: bool, no_apiserver_proxy: bool) -> Self {
        match (ha_cluster, clustered) {
            (false, false) => Self::Single,
            (false, true) => Self::LegacyReplicated,
            (true, true) if !no_apiserver_proxy => Self::ConsensusWorker,
            (true, _) => Self::ConsensusControlPlane,
        }
    }

    /// Returns true if the node runs (or follows) the consensus store
    pub fn is_consensus(&self) -> bool {
        matches!(self, Self::ConsensusControlPlane | Self::ConsensusWorker)
    }

    /// Returns true if the node is already part of a multi-node cluster as a worker
    pub fn is_worker(&self) -> bool {
        matches!(self, Self::LegacyReplicated | Self::ConsensusWorker)
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Single => "single-node",
            Self::LegacyReplicated => "legacy-replicated",
            Self::ConsensusControlPlane => "consensus-control-plane",
            Self::ConsensusWorker => "consensus-worker",
        };
        f.write_str(name)
    }
}

/// Consensus store member role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeRole {
    Voter,
    StandBy,
    Spare,
}

impl TryFrom<u8> for NodeRole {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Voter),
            1 => Ok(Self::StandBy),
            2 => Ok(Self::Spare),
            other => Err(format!("unknown node role {other}")),
        }
    }
}

impl From<NodeRole> for u8 {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Voter => 0,
            NodeRole::StandBy => 1,
            NodeRole::Spare => 2,
        }
    }
}

/// A consensus store member as reported by the store itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterSetEntry {
    #[serde(rename = "ID", default)]
    pub id: u64,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Role", default = "default_role")]
    pub role: NodeRole,
}

fn default_role() -> NodeRole {
    NodeRole::Voter
}

impl VoterSetEntry {
    /// Host part of the member address, without brackets or port
    pub fn host(&self) -> &str {
        address_host(&self.address)
    }

    pub fn is_voter(&self) -> bool {
        self.role == NodeRole::Voter
    }
}

/// Strip the port (and IPv6 brackets) from a `host:port` address
pub fn address_host(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        // Bare IPv6 literal without a port
        Some((host, _)) if host.contains(':') => address,
        Some((host, _)) => host,
        None => address,
    }
}

/// Format `host:port`, bracketing IPv6 hosts
pub fn join_host_port(host: &str, port: impl fmt::Display) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// One stored token line: `token` or `token|expiry_unix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEntry {
    pub token: String,
    /// Absolute Unix time after which the token no longer validates
    pub expiry: Option<i64>,
}

impl TokenEntry {
    pub fn new(token: impl Into<String>, expiry: Option<i64>) -> Self {
        Self {
            token: token.into(),
            expiry,
        }
    }

    /// Parse a stored line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match line.split_once('|') {
            Some((token, expiry)) => Some(Self {
                token: token.to_string(),
                // An unparsable expiry is treated as already expired
                expiry: Some(expiry.trim().parse().unwrap_or(i64::MIN)),
            }),
            None => Some(Self::new(line, None)),
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry.is_some_and(|expiry| now > expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}

impl fmt::Display for TokenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expiry {
            Some(expiry) => write!(f, "{}|{}", self.token, expiry),
            None => f.write_str(&self.token),
        }
    }
}

/// Parsed join string: `host:port/token[/fingerprint]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host: IpAddr,
    pub port: u16,
    pub token: String,
    pub fingerprint: Option<String>,
}

impl ConnectionString {
    /// `host:port` of the peer agent
    pub fn endpoint(&self) -> String {
        join_host_port(&self.host.to_string(), self.port)
    }
}

impl FromStr for ConnectionString {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(ClusterError::InvalidInput(
                "expected format <master_IP>:<master_PORT>/<token>[/<fingerprint>]".into(),
            ));
        }

        let (host, port) = parts[0].rsplit_once(':').ok_or_else(|| {
            ClusterError::InvalidInput(format!("missing port in {:?}", parts[0]))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host: IpAddr = host.parse().map_err(|_| {
            ClusterError::InvalidInput(format!("expected an IP address, got {host:?}"))
        })?;
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ClusterError::InvalidInput(format!("invalid port {port:?}")))?;

        let token = parts[1].to_string();
        if token.len() < TOKEN_MIN_LEN {
            return Err(ClusterError::InvalidInput(format!(
                "token must be at least {TOKEN_MIN_LEN} characters"
            )));
        }

        let fingerprint = parts
            .get(2)
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty());

        Ok(Self {
            host,
            port,
            token,
            fingerprint,
        })
    }
}
