//! Cluster membership operations run from the CLI.
//!
//! Implements:
//! - join (legacy replicated store, consensus worker, consensus control plane)
//! - leave and remove-node
//! - bootstrap token issuing and join strings
//! - fleet-wide configuration distribution

mod fleet;
mod join;
mod leave;
mod remove;
mod tokens;

pub use fleet::{DistributeAction, distribute, known_peers};
pub use join::{JoinOptions, join};
pub use leave::leave;
pub use remove::remove_node;
pub use tokens::{TokenFormat, add_token};
