//! # Muster - Cluster Bootstrap and Membership
//!
//! Runs the cluster agent every node exposes to joiners and peers, and the
//! operator commands that join, leave and reshape a cluster.
//!
//! ## Architecture
//! ```text
//! muster join ──HTTPS──▶ Agent (peer) ──▶ credentials, certs, consensus store
//!      │                                         │
//!      └──▶ local args, kubeconfigs, services ◀──┘
//! ```

use anyhow::{Context, Result};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use muster_common::constants::{FINGERPRINT_MIN_LEN, files as layout};
use muster_common::{ClusterError, ConnectionString};

mod certs;
mod client;
mod cluster;
mod cni;
mod config;
mod consensus;
mod exec;
mod kube;
mod kubeconfig;
mod membership;
mod network;
mod paths;
mod routes;
mod services;
mod state;
mod store;

use client::{AgentClient, PeerAgent};
use cluster::{DistributeAction, JoinOptions, TokenFormat};
use config::AppConfig;
use state::AppState;

/// Muster - cluster bootstrap and membership agent
#[derive(Parser, Debug)]
#[command(name = "muster")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "/etc/muster/muster.toml")]
    config: String,

    /// Per-node state directory (overrides config)
    #[arg(long, global = true, env = "SNAP_DATA")]
    pub snap_data: Option<PathBuf>,

    /// Install directory (overrides config)
    #[arg(long, global = true, env = "SNAP")]
    pub snap: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cluster agent
    Agent {
        /// Listen address (overrides config)
        #[arg(short, long, env = "LISTEN_ADDR")]
        bind: Option<String>,

        /// Serving certificate (defaults to the node server certificate)
        #[arg(long)]
        cert: Option<PathBuf>,

        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Join the cluster of the node behind a connection string
    Join {
        /// `<master_IP>:<master_PORT>/<token>[/<fingerprint>]`
        connection: String,

        /// Join as a worker, without the control plane
        #[arg(long, conflicts_with = "controlplane")]
        worker: bool,

        /// Join as a control plane node (the default)
        #[arg(long)]
        controlplane: bool,

        /// Do not check the peer certificate fingerprint
        #[arg(long)]
        skip_verify: bool,

        #[arg(long)]
        disable_low_memory_guard: bool,
    },

    /// Leave the cluster and return to a standalone node
    Leave,

    /// Remove another node from the cluster
    RemoveNode {
        /// Node name or address
        node: String,

        /// Remove a node that is still a consensus store member
        #[arg(long)]
        force: bool,
    },

    /// Issue a bootstrap token and print the join strings for it
    AddToken {
        /// Lifetime in seconds; a negative value issues a token that never expires
        #[arg(short = 'l', long, allow_negative_numbers = true)]
        token_ttl: Option<i64>,

        /// Use this token instead of a random one
        #[arg(short, long)]
        token: Option<String>,

        #[arg(long, value_enum, default_value = "long")]
        format: TokenFormat,
    },

    /// Apply a change on this node and every known peer
    Distribute {
        #[command(subcommand)]
        action: DistributeAction,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.json_logs) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    // Both the agent listener and the peer client run on ring
    let _ = rustls::crypto::ring::default_provider().install_default();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit status for a failed command, taken from the first cluster error in the chain
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ClusterError>())
        .map_or(1, ClusterError::exit_code)
}

/// Negative lifetimes mean no expiry; zero expires the token at issue time
fn token_lifetime(secs: Option<i64>) -> Option<Duration> {
    secs.and_then(|secs| u64::try_from(secs).ok()).map(Duration::from_secs)
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli.config, &cli)?;
    info!("📋 Configuration loaded from {}", cli.config);
    let state = AppState::new(config);

    match cli.command {
        Command::Agent { bind, cert, key } => serve(state, bind, cert, key).await?,
        Command::Join {
            connection,
            worker,
            skip_verify,
            disable_low_memory_guard,
            ..
        } => {
            let connection: ConnectionString = connection.parse()?;
            let fingerprint = if skip_verify {
                None
            } else {
                connection.fingerprint.as_deref()
            };
            if fingerprint.is_some_and(|fp| fp.len() < FINGERPRINT_MIN_LEN) {
                return Err(ClusterError::InvalidInput(format!(
                    "fingerprint must be at least {FINGERPRINT_MIN_LEN} characters"
                ))
                .into());
            }
            let peer = AgentClient::new(
                &connection.endpoint(),
                fingerprint,
                state.config.client_timeout(),
            )?;

            let options = JoinOptions {
                connection,
                worker,
                disable_low_memory_guard,
            };
            cluster::join(&state, &peer, &options).await?;
            println!("Successfully joined the cluster.");
        }
        Command::Leave => cluster::leave(&state).await?,
        Command::RemoveNode { node, force } => cluster::remove_node(&state, &node, force).await?,
        Command::AddToken {
            token_ttl,
            token,
            format,
        } => {
            let strings = cluster::add_token(&state, token_lifetime(token_ttl), token).await?;
            println!("{}", strings.render(format)?);
        }
        Command::Distribute { action } => {
            let clients = cluster::known_peers(&state)?;
            let peers: Vec<(&dyn PeerAgent, String)> = clients
                .iter()
                .map(|(client, token)| (client as &dyn PeerAgent, token.clone()))
                .collect();

            let outcomes = cluster::distribute(&state, &action, &peers).await?;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.error {
                    None => println!("{}: ok", outcome.endpoint),
                    Some(e) => {
                        failed += 1;
                        println!("{}: {e}", outcome.endpoint);
                    }
                }
            }
            if failed > 0 {
                warn!(failed, total = outcomes.len(), "Some peers did not apply the change");
            }
        }
    }

    Ok(())
}

/// Run the cluster agent until ctrl-c
async fn serve(
    state: AppState,
    bind: Option<String>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<()> {
    info!("🔥 Starting Muster agent v{}", env!("CARGO_PKG_VERSION"));

    let expired = state.credentials.remove_expired()?;
    if expired > 0 {
        info!(expired, "Expired bootstrap tokens removed");
    }

    let listen = bind.unwrap_or_else(|| state.config.listen_addr.clone());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address {listen}"))?;
    let cert = cert.unwrap_or_else(|| state.paths.data(layout::SERVER_CERT));
    let key = key.unwrap_or_else(|| state.paths.data(layout::SERVER_KEY));
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .with_context(|| format!("Failed to load serving certificate {}", cert.display()))?;

    let app = routes::create_router(state);

    // Handle graceful shutdown
    let handle = Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        info!("🛑 Shutdown signal received");
        shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("🚀 Muster agent listening on {}", addr);
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("Server error")?;

    info!("👋 Muster agent shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_follows_cluster_error() {
        let err = anyhow::Error::new(ClusterError::QuorumSafety("sole voter".into()))
            .context("leave failed");
        assert_eq!(exit_code(&err), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }

    #[test]
    fn test_token_lifetime() {
        assert_eq!(token_lifetime(None), None);
        assert_eq!(token_lifetime(Some(-1)), None);
        assert_eq!(token_lifetime(Some(0)), Some(Duration::ZERO));
        assert_eq!(token_lifetime(Some(3600)), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "muster",
            "add-token",
            "--token-ttl",
            "-1",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::AddToken {
                token_ttl: Some(-1),
                format: TokenFormat::Json,
                ..
            }
        ));

        // Argument keys start with dashes, so they go after `--`
        let cli = Cli::try_parse_from([
            "muster",
            "distribute",
            "update-argument",
            "--",
            "kubelet",
            "--v",
            "3",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Distribute {
                action: DistributeAction::UpdateArgument { .. }
            }
        ));
    }
}
