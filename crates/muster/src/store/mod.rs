//! Node-local state.
//!
//! Implements:
//! - Credential store (join, certificate request, callback, identity tokens)
//! - Service argument files
//! - Lock-file flags and cluster mode
//! - Backup-then-replace persistence shared by all of the above

mod args;
mod credentials;
pub mod files;
mod locks;

pub use args::{ServiceArgs, parse_argument};
pub use credentials::{CredentialStore, TokenKind, generate_hex_token};
pub use locks::LockFiles;
