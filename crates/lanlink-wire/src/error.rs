//! Errors from the wire layer.

use lanlink_types::IdentityError;
use thiserror::Error;

/// Errors from handshakes, secure channels and the peer manager.
#[derive(Debug, Error)]
pub enum WireError {
    /// A handshake or frame was structurally malformed.
    #[error("Framing error: {0}")]
    Framing(String),
    /// A key on the wire or in a sighting had the wrong size.
    #[error("Invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidKeyLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// The peer's handshake signature did not verify.
    #[error("Invalid handshake signature")]
    InvalidSignature,
    /// The peer's ephemeral key produced an all-zero shared secret.
    #[error("Peer sent a non-contributory exchange key")]
    WeakExchangeKey,
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The connection was closed, locally or by the remote end.
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Handshake timed out")]
    Timeout,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    /// AEAD authentication failed on an inbound frame.
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Peer not found: {0}")]
    PeerNotFound(String),
    /// The peer is known but has no dialable address yet.
    #[error("Peer {0} has no known address")]
    Unreachable(String),
    /// The peer was sighted at a new address while we were dialing the old one.
    #[error("Peer {0} moved while connecting")]
    PeerMoved(String),
    #[error("Handshake with {peer} failed: {source}")]
    HandshakeFailed {
        peer: String,
        #[source]
        source: Box<WireError>,
    },
    /// The peer at a known address proved a different identity.
    #[error("Expected peer {expected}, but the remote identified as {actual}")]
    IdentityMismatch { expected: String, actual: String },
    #[error("Remote presented the local identity")]
    SelfConnection,
    #[error("Peer manager is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl WireError {
    /// Wrap a handshake-stage error with the peer it concerns.
    pub(crate) fn handshake(peer: impl Into<String>, source: WireError) -> Self {
        WireError::HandshakeFailed {
            peer: peer.into(),
            source: Box::new(source),
        }
    }
}
