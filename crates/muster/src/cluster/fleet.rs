//! Configuration changes pushed to every known peer.

use std::collections::BTreeMap;
use std::fmt;

use muster_common::ClusterError;
use muster_common::api::{ConfigureAddon, ConfigureRequest, ConfigureService};

use crate::client::{AgentClient, PeerAgent};
use crate::routes::apply_configuration;
use crate::state::AppState;

/// A change applied on this node and every peer
#[derive(Debug, Clone, PartialEq, Eq, clap::Subcommand)]
pub enum DistributeAction {
    /// Restart a service everywhere
    Restart { service: String },
    /// Set a service argument everywhere and restart the service
    UpdateArgument {
        service: String,
        key: String,
        value: String,
    },
    /// Drop a service argument everywhere and restart the service
    RemoveArgument { service: String, key: String },
    EnableAddon { addon: String },
    DisableAddon { addon: String },
}

impl DistributeAction {
    fn request(&self, callback: &str) -> ConfigureRequest {
        let mut request = ConfigureRequest {
            callback: callback.to_string(),
            ..ConfigureRequest::default()
        };
        match self {
            Self::Restart { service } => request.service.push(ConfigureService {
                name: service.clone(),
                restart: true,
                ..ConfigureService::default()
            }),
            Self::UpdateArgument { service, key, value } => request.service.push(ConfigureService {
                name: service.clone(),
                arguments_update: vec![BTreeMap::from([(key.clone(), value.clone())])],
                restart: true,
                ..ConfigureService::default()
            }),
            Self::RemoveArgument { service, key } => request.service.push(ConfigureService {
                name: service.clone(),
                arguments_remove: vec![key.clone()],
                restart: true,
                ..ConfigureService::default()
            }),
            Self::EnableAddon { addon } => request.addon.push(ConfigureAddon {
                name: addon.clone(),
                enable: true,
                disable: false,
            }),
            Self::DisableAddon { addon } => request.addon.push(ConfigureAddon {
                name: addon.clone(),
                enable: false,
                disable: true,
            }),
        }
        request
    }
}

impl fmt::Display for DistributeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restart { service } => write!(f, "restart {service}"),
            Self::UpdateArgument { service, key, value } => write!(f, "set {key}={value} on {service}"),
            Self::RemoveArgument { service, key } => write!(f, "remove {key} from {service}"),
            Self::EnableAddon { addon } => write!(f, "enable {addon}"),
            Self::DisableAddon { addon } => write!(f, "disable {addon}"),
        }
    }
}

/// Result of pushing a change to one peer
#[derive(Debug)]
pub struct PeerOutcome {
    pub endpoint: String,
    pub error: Option<ClusterError>,
}

/// Agents recorded in the callback token file, with the token each expects
pub fn known_peers(node: &AppState) -> Result<Vec<(AgentClient, String)>, ClusterError> {
    node.credentials
        .peer_callback_tokens()?
        .into_iter()
        .map(|(endpoint, token)| {
            let client = AgentClient::new(&endpoint, None, node.config.client_timeout())?;
            Ok((client, token))
        })
        .collect()
}

/// Push `action` to every peer, then apply it locally.
///
/// A failing peer is reported in its outcome and does not stop the others.
pub async fn distribute(
    node: &AppState,
    action: &DistributeAction,
    peers: &[(&dyn PeerAgent, String)],
) -> Result<Vec<PeerOutcome>, ClusterError> {
    let mut outcomes = Vec::with_capacity(peers.len());
    for (peer, token) in peers {
        let endpoint = peer.endpoint().to_string();
        let error = match peer.configure(&action.request(token)).await {
            Ok(()) => {
                tracing::info!(peer = %endpoint, %action, "Peer configured");
                None
            }
            Err(e) => {
                tracing::warn!(peer = %endpoint, %action, error = %e, "Peer configuration failed");
                Some(e)
            }
        };
        outcomes.push(PeerOutcome { endpoint, error });
    }

    apply_configuration(node, &action.request("")).await?;
    tracing::info!(%action, peers = outcomes.len(), "Change applied locally");
    Ok(outcomes)
}
