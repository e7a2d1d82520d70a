//! Common error types for Muster components.

use thiserror::Error;

/// Errors raised by cluster bootstrap and membership operations.
///
/// Each variant is a distinct failure class: callers map it to an HTTP
/// status on the agent side and to a process exit status on the CLI side.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Bad, expired, or already consumed token
    #[error("{0}")]
    Authentication(String),

    /// Peer certificate did not match the pinned fingerprint
    #[error("{0}")]
    PeerVerification(String),

    /// Peer cannot service this kind of request
    #[error("{0}")]
    Compatibility(String),

    /// Peer unreachable or handshake failed
    #[error("{0}")]
    TransientNetwork(String),

    /// Operation would leave the cluster without a usable voter
    #[error("{0}")]
    QuorumSafety(String),

    /// Missing or malformed node-local state
    #[error("{0}")]
    LocalState(String),

    /// Invalid input/request
    #[error("{0}")]
    InvalidInput(String),

    /// Requested resource does not exist
    #[error("{0}")]
    NotFound(String),

    /// An external tool exited unsuccessfully
    #[error("{0}")]
    ExternalCommand(String),

    /// Internal error
    #[error("{0}")]
    Internal(String),
}

impl ClusterError {
    /// Returns the HTTP status code for this error.
    ///
    /// Token failures answer 500 so that existing joiners keep parsing them.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound(_) => 404,
            Self::TransientNetwork(_) => 503,
            _ => 500,
        }
    }

    /// Returns the process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidInput(_) | Self::NotFound(_) | Self::Internal(_) => 1,
            Self::LocalState(_) => 2,
            Self::QuorumSafety(_) => 3,
            Self::PeerVerification(_) => 4,
            Self::TransientNetwork(_) => 5,
            Self::Authentication(_) => 6,
            Self::Compatibility(_) => 7,
            Self::ExternalCommand(_) => 8,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Short class name used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::PeerVerification(_) => "peer_verification",
            Self::Compatibility(_) => "compatibility",
            Self::TransientNetwork(_) => "transient_network",
            Self::QuorumSafety(_) => "quorum_safety",
            Self::LocalState(_) => "local_state",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::ExternalCommand(_) => "external_command",
            Self::Internal(_) => "internal",
        }
    }

    /// Rebuild an error reported by a peer agent from its `kind`.
    ///
    /// Peers that predate the field, or send an unknown kind, are treated
    /// as token failures.
    pub fn from_kind(kind: Option<&str>, message: String) -> Self {
        match kind {
            Some("peer_verification") => Self::PeerVerification(message),
            Some("compatibility") => Self::Compatibility(message),
            Some("transient_network") => Self::TransientNetwork(message),
            Some("quorum_safety") => Self::QuorumSafety(message),
            Some("local_state") => Self::LocalState(message),
            Some("invalid_input") => Self::InvalidInput(message),
            Some("not_found") => Self::NotFound(message),
            Some("external_command") => Self::ExternalCommand(message),
            Some("internal") => Self::Internal(message),
            _ => Self::Authentication(message),
        }
    }

    /// Wraps an I/O failure on a node-local path
    pub fn io(path: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::LocalState(format!("{path}: {err}"))
    }
}
