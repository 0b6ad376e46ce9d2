//! Core types for lanlink: node identity and configuration.
//!
//! Everything that has to agree between the wire layer and the binary lives
//! here: the long-term [`Identity`] every node is known by, and the
//! configuration structs the CLI loads from `config.toml`.

pub mod config;
pub mod identity;

pub use config::{DiscoveryConfig, LanlinkConfig, NetworkConfig};
pub use identity::{Identity, IdentityError, IdentityPolicy};
