//! Mutually authenticated ephemeral key agreement.
//!
//! Each side sends one [`HandshakeMessage`] carrying its long-term id, a
//! fresh X25519 public key and a random nonce, signed with its long-term
//! Ed25519 key over `signing_public_key ‖ ephemeral_public_key ‖ nonce`.
//! Both sides verify the other's signature, run X25519 between their own
//! ephemeral secret and the peer's ephemeral public key, and hash the result
//! with SHA-256 into an AES-256-GCM session key.
//!
//! The initiator always writes first and the responder always reads first,
//! so the two sides can never both block on a read.
//!
//! Wire layout: four fields in order (id, ephemeral key, signature, nonce),
//! each a big-endian `u16` length followed by unpadded URL-safe base64 text.

use crate::error::WireError;
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lanlink_types::identity::{self, Identity, EXCHANGE_KEY_LENGTH};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangePublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Random bytes bound into each handshake signature.
pub const HANDSHAKE_NONCE_LEN: usize = 16;

const SIGNING_KEY_LEN: usize = 32;

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out; sends first.
    Initiator,
    /// Accepted the connection; reads first.
    Responder,
}

/// One side's handshake message, holding the encoded text of each field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    /// Sender's long-term id (encoded signing public key).
    pub identity_id: String,
    /// Single-use X25519 public key.
    pub ephemeral_public_key: String,
    /// Ed25519 signature over key ‖ ephemeral key ‖ nonce.
    pub signature: String,
    pub nonce: String,
}

/// A peer whose handshake message has been validated and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub id: String,
    pub ephemeral_public_key: [u8; EXCHANGE_KEY_LENGTH],
}

/// Symmetric key for one channel. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// SHA-256 of the raw Diffie-Hellman output.
    fn derive(shared_secret: &[u8]) -> Self {
        let digest = Sha256::digest(shared_secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub session_key: SessionKey,
    /// The authenticated remote id.
    pub remote_id: String,
    /// The remote's ephemeral exchange key for this session.
    pub remote_exchange_key: [u8; EXCHANGE_KEY_LENGTH],
}

impl HandshakeMessage {
    /// Build and sign a message announcing `ephemeral_public`.
    pub fn sign(identity: &Identity, ephemeral_public: &[u8; EXCHANGE_KEY_LENGTH], nonce: &[u8]) -> Self {
        let transcript = signed_bytes(&identity.signing_public_key(), ephemeral_public, nonce);
        Self {
            identity_id: identity.id(),
            ephemeral_public_key: URL_SAFE_NO_PAD.encode(ephemeral_public),
            signature: URL_SAFE_NO_PAD.encode(identity.sign(&transcript)),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
        }
    }

    /// Encode as four length-prefixed fields.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let fields = [
            &self.identity_id,
            &self.ephemeral_public_key,
            &self.signature,
            &self.nonce,
        ];
        let mut out = Vec::with_capacity(fields.iter().map(|f| 2 + f.len()).sum());
        for field in fields {
            let len = u16::try_from(field.len()).map_err(|_| {
                WireError::Framing(format!("handshake field of {} bytes", field.len()))
            })?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(field.as_bytes());
        }
        Ok(out)
    }

    /// Read one message from the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        Ok(Self {
            identity_id: read_field(reader).await?,
            ephemeral_public_key: read_field(reader).await?,
            signature: read_field(reader).await?,
            nonce: read_field(reader).await?,
        })
    }

    /// Decode every field, check sizes, and verify the signature.
    pub fn verify(&self) -> Result<VerifiedPeer, WireError> {
        let signing_key = decode_exact::<SIGNING_KEY_LEN>("signing public key", &self.identity_id)?;
        let ephemeral =
            decode_exact::<EXCHANGE_KEY_LENGTH>("exchange public key", &self.ephemeral_public_key)?;
        let nonce = decode("nonce", &self.nonce)?;
        if nonce.len() < HANDSHAKE_NONCE_LEN {
            return Err(WireError::Framing(format!(
                "handshake nonce of {} bytes, need at least {HANDSHAKE_NONCE_LEN}",
                nonce.len()
            )));
        }
        let signature = decode("signature", &self.signature)?;

        let transcript = signed_bytes(&signing_key, &ephemeral, &nonce);
        if !identity::verify(&signing_key, &transcript, &signature)? {
            return Err(WireError::InvalidSignature);
        }

        Ok(VerifiedPeer {
            id: identity::encode_id(&signing_key),
            ephemeral_public_key: ephemeral,
        })
    }
}

/// Run the handshake over `stream`.
///
/// No deadline is applied here; callers wrap this in a timeout. On error the
/// caller is expected to drop the stream.
pub async fn perform<S>(
    stream: &mut S,
    identity: &Identity,
    role: Role,
) -> Result<HandshakeOutcome, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = ExchangePublicKey::from(&ephemeral);
    let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ours = HandshakeMessage::sign(identity, ephemeral_public.as_bytes(), &nonce).encode()?;

    let peer = match role {
        Role::Initiator => {
            stream.write_all(&ours).await?;
            stream.flush().await?;
            HandshakeMessage::read_from(stream).await?.verify()?
        }
        Role::Responder => {
            let peer = HandshakeMessage::read_from(stream).await?.verify()?;
            stream.write_all(&ours).await?;
            stream.flush().await?;
            peer
        }
    };

    let shared = ephemeral.diffie_hellman(&ExchangePublicKey::from(peer.ephemeral_public_key));
    if !shared.was_contributory() {
        return Err(WireError::WeakExchangeKey);
    }

    debug!(peer = %peer.id, ?role, "Handshake complete");
    Ok(HandshakeOutcome {
        session_key: SessionKey::derive(shared.as_bytes()),
        remote_id: peer.id,
        remote_exchange_key: peer.ephemeral_public_key,
    })
}

fn signed_bytes(signing_key: &[u8], ephemeral: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(signing_key.len() + ephemeral.len() + nonce.len());
    buf.extend_from_slice(signing_key);
    buf.extend_from_slice(ephemeral);
    buf.extend_from_slice(nonce);
    buf
}

async fn read_field<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, WireError> {
    let len = reader.read_u16().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| WireError::Framing("handshake field is not UTF-8".into()))
}

fn decode(what: &str, text: &str) -> Result<Vec<u8>, WireError> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| WireError::Framing(format!("handshake {what}: {e}")))
}

fn decode_exact<const N: usize>(what: &'static str, text: &str) -> Result<[u8; N], WireError> {
    let bytes = decode(what, text)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| WireError::InvalidKeyLength {
            what,
            expected: N,
            got: bytes.len(),
        })
}
