//! # Muster Common
//!
//! Shared types and utilities used across Muster components.
//!
//! ## Modules
//! - `types` - Cluster mode, consensus members, token lines, join strings
//! - `api` - Cluster agent wire payloads
//! - `error` - Error taxonomy shared by the agent and the CLI
//! - `constants` - Ports, file layout, lock names

pub mod api;
pub mod constants;
pub mod error;
pub mod types;

pub use error::ClusterError;
pub use types::*;
