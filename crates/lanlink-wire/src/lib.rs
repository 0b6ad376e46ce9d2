//! lanlink wire layer: authenticated, encrypted peer channels on a LAN.
//!
//! Peers find each other by UDP multicast, then open TCP connections that
//! run a signed ephemeral X25519 handshake and carry AES-256-GCM frames.
//!
//! ## Architecture
//!
//! - **Handshake**: mutual authentication and session key agreement
//! - **SecureChannel**: framed, encrypted message stream to one peer
//! - **PeerRegistry**: known peers, addresses and live channels
//! - **PeerManager**: dials, accepts and supervises channels
//! - **Listener** / **DiscoveryService**: inbound TCP and multicast discovery

pub mod channel;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod manager;
pub mod registry;

pub use channel::{SecureChannel, MAX_FRAME_LEN, MAX_PLAINTEXT_LEN};
pub use discovery::{Announcement, DiscoveryService};
pub use error::WireError;
pub use handshake::{HandshakeMessage, HandshakeOutcome, Role, SessionKey};
pub use listener::Listener;
pub use manager::{ManagerConfig, PeerManager};
pub use registry::{Direction, PeerRecord, PeerRegistry, Sighting, SightingOutcome};
