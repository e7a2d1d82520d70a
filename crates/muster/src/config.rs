//! Configuration management for Muster.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use muster_common::constants::{DEFAULT_LISTEN_ADDR, DEFAULT_REQUEST_TIMEOUT_SECS};

use crate::paths::Paths;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Per-node writable state root
    #[serde(default = "default_snap_data")]
    pub snap_data: PathBuf,

    /// Read-only install root (wrappers, default args, consensus CLI)
    #[serde(default = "default_snap")]
    pub snap: PathBuf,

    /// Cluster agent listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Agent per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for calls made to a peer agent
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Timeout for external commands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Bounded polling parameters
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Bounded retry/polling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Polls of the member list after starting a joining consensus store
    #[serde(default = "default_consensus_wait_attempts")]
    pub consensus_wait_attempts: u32,

    #[serde(default = "default_consensus_wait_interval")]
    pub consensus_wait_interval_secs: u64,

    /// Interval after a failed member list call
    #[serde(default = "default_consensus_error_interval")]
    pub consensus_error_interval_secs: u64,

    /// Polls while the first node moves off the loopback address
    #[serde(default = "default_first_node_attempts")]
    pub first_node_wait_attempts: u32,

    #[serde(default = "default_first_node_interval")]
    pub first_node_wait_interval_secs: u64,

    /// Attempts to apply the CNI manifest after a leave
    #[serde(default = "default_cni_attempts")]
    pub cni_apply_attempts: u32,

    #[serde(default = "default_cni_interval")]
    pub cni_apply_interval_secs: u64,

    /// Pause after stopping control plane services
    #[serde(default = "default_settle")]
    pub service_settle_secs: u64,
}

impl RetryConfig {
    pub fn consensus_wait_interval(&self) -> Duration {
        Duration::from_secs(self.consensus_wait_interval_secs)
    }

    pub fn consensus_error_interval(&self) -> Duration {
        Duration::from_secs(self.consensus_error_interval_secs)
    }

    pub fn first_node_wait_interval(&self) -> Duration {
        Duration::from_secs(self.first_node_wait_interval_secs)
    }

    pub fn cni_apply_interval(&self) -> Duration {
        Duration::from_secs(self.cni_apply_interval_secs)
    }

    pub fn service_settle(&self) -> Duration {
        Duration::from_secs(self.service_settle_secs)
    }

    /// Same attempt counts, no sleeping
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            consensus_wait_interval_secs: 0,
            consensus_error_interval_secs: 0,
            first_node_wait_interval_secs: 0,
            cni_apply_interval_secs: 0,
            service_settle_secs: 0,
            ..Self::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            consensus_wait_attempts: default_consensus_wait_attempts(),
            consensus_wait_interval_secs: default_consensus_wait_interval(),
            consensus_error_interval_secs: default_consensus_error_interval(),
            first_node_wait_attempts: default_first_node_attempts(),
            first_node_wait_interval_secs: default_first_node_interval(),
            cni_apply_attempts: default_cni_attempts(),
            cni_apply_interval_secs: default_cni_interval(),
            service_settle_secs: default_settle(),
        }
    }
}

// Default value functions
fn default_snap_data() -> PathBuf { PathBuf::from("/var/snap/microk8s/current") }
fn default_snap() -> PathBuf { PathBuf::from("/snap/microk8s/current") }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_request_timeout() -> u64 { DEFAULT_REQUEST_TIMEOUT_SECS }
fn default_client_timeout() -> u64 { 60 }
fn default_command_timeout() -> u64 { 300 } // 5 minutes
fn default_consensus_wait_attempts() -> u32 { 10 }
fn default_consensus_wait_interval() -> u64 { 5 }
fn default_consensus_error_interval() -> u64 { 2 }
fn default_first_node_attempts() -> u32 { 30 }
fn default_first_node_interval() -> u64 { 2 }
fn default_cni_attempts() -> u32 { 10 }
fn default_cni_interval() -> u64 { 5 }
fn default_settle() -> u64 { 10 }

impl AppConfig {
    /// Load configuration from file, with CLI/env overrides
    pub fn load(config_path: &str, cli: &super::Cli) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::debug!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref snap_data) = cli.snap_data {
            config.snap_data = snap_data.clone();
        }
        if let Some(ref snap) = cli.snap {
            config.snap = snap.clone();
        }

        Ok(config)
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.snap_data, &self.snap)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            snap_data: default_snap_data(),
            snap: default_snap(),
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout(),
            client_timeout_secs: default_client_timeout(),
            command_timeout_secs: default_command_timeout(),
            retry: RetryConfig::default(),
        }
    }
}
