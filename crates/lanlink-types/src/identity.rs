//! Long-term node identity.
//!
//! An [`Identity`] holds two keypairs:
//! 1. An Ed25519 signing keypair (via `ed25519-dalek`). Its public key,
//!    encoded as unpadded URL-safe base64, is the node's id.
//! 2. An X25519 key-exchange keypair (via `x25519-dalek`), advertised in
//!    discovery announcements.
//!
//! Identities are created once, persisted as a JSON document, and loaded
//! unchanged for the rest of the process lifetime.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, KEYPAIR_LENGTH, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of an X25519 public or private key.
pub const EXCHANGE_KEY_LENGTH: usize = 32;

/// Errors from identity creation, persistence and verification.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The OS random source could not produce key material.
    #[error("Secure random source unavailable: {0}")]
    CryptoUnavailable(String),
    /// The identity file exists but its contents are unusable.
    #[error("Corrupt identity: {0}")]
    CorruptIdentity(String),
    /// Reading or writing the identity file failed.
    #[error("Identity IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A public key had the wrong size.
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    /// A peer id is not valid base64.
    #[error("Invalid peer id '{0}'")]
    InvalidId(String),
}

/// What to do when an identity file exists but cannot be loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    /// Treat an unreadable file like a missing one and mint a new identity.
    #[default]
    Regenerate,
    /// Only generate when no file exists; fail on a corrupt file.
    Strict,
}

/// On-disk layout. Field names are stable within a deployment.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityFile {
    signing_private_key: String,
    signing_public_key: String,
    exchange_private_key: String,
    exchange_public_key: String,
}

/// A node's long-term signing and key-exchange keypairs.
///
/// Secret material is zeroized on drop by the underlying key types.
pub struct Identity {
    signing_key: SigningKey,
    exchange_secret: StaticSecret,
    exchange_public: ExchangePublicKey,
}

impl Identity {
    /// Generate a fresh identity from the OS random source.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        let mut exchange = Zeroizing::new([0u8; EXCHANGE_KEY_LENGTH]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| IdentityError::CryptoUnavailable(e.to_string()))?;
        OsRng
            .try_fill_bytes(&mut exchange[..])
            .map_err(|e| IdentityError::CryptoUnavailable(e.to_string()))?;

        let exchange_secret = StaticSecret::from(*exchange);
        let exchange_public = ExchangePublicKey::from(&exchange_secret);
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
            exchange_secret,
            exchange_public,
        })
    }

    /// Load an identity previously written by [`Identity::save`].
    ///
    /// A missing file surfaces as [`IdentityError::Io`]; anything wrong with
    /// the contents (bad JSON, bad base64, wrong sizes, public halves that do
    /// not match their private halves) is [`IdentityError::CorruptIdentity`].
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let contents = Zeroizing::new(std::fs::read_to_string(path)?);
        let file: IdentityFile = serde_json::from_str(&contents)
            .map_err(|e| IdentityError::CorruptIdentity(format!("{}: {e}", path.display())))?;

        let keypair = decode_field::<KEYPAIR_LENGTH>("signing_private_key", &file.signing_private_key)?;
        let signing_public =
            decode_field::<PUBLIC_KEY_LENGTH>("signing_public_key", &file.signing_public_key)?;
        let exchange_private =
            decode_field::<EXCHANGE_KEY_LENGTH>("exchange_private_key", &file.exchange_private_key)?;
        let exchange_public =
            decode_field::<EXCHANGE_KEY_LENGTH>("exchange_public_key", &file.exchange_public_key)?;

        let signing_key = SigningKey::from_keypair_bytes(&keypair).map_err(|_| {
            IdentityError::CorruptIdentity("signing keypair halves do not match".into())
        })?;
        if signing_key.verifying_key().to_bytes() != *signing_public {
            return Err(IdentityError::CorruptIdentity(
                "signing public key does not match private key".into(),
            ));
        }

        let exchange_secret = StaticSecret::from(*exchange_private);
        let derived = ExchangePublicKey::from(&exchange_secret);
        if derived.as_bytes() != &*exchange_public {
            return Err(IdentityError::CorruptIdentity(
                "exchange public key does not match private key".into(),
            ));
        }

        Ok(Self {
            signing_key,
            exchange_secret,
            exchange_public: derived,
        })
    }

    /// Persist this identity, creating missing parent directories.
    ///
    /// SECURITY: the file is restricted to owner-only access on Unix.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let keypair = Zeroizing::new(self.signing_key.to_keypair_bytes());
        let exchange_private = Zeroizing::new(self.exchange_secret.to_bytes());
        let file = IdentityFile {
            signing_private_key: URL_SAFE_NO_PAD.encode(&keypair[..]),
            signing_public_key: URL_SAFE_NO_PAD.encode(self.signing_public_key()),
            exchange_private_key: URL_SAFE_NO_PAD.encode(&exchange_private[..]),
            exchange_public_key: URL_SAFE_NO_PAD.encode(self.exchange_public_key()),
        };
        let json = Zeroizing::new(
            serde_json::to_string_pretty(&file).map_err(std::io::Error::from)?,
        );

        std::fs::write(path, json.as_bytes())?;
        restrict_file_permissions(path);
        Ok(())
    }

    /// Load the identity at `path`, or generate and save a new one.
    ///
    /// Any load failure leads to regeneration, so a malformed file is
    /// silently replaced. Use [`Identity::load_or_generate`] with
    /// [`IdentityPolicy::Strict`] to refuse that.
    pub fn get_or_create(path: &Path) -> Result<Self, IdentityError> {
        Self::load_or_generate(path, IdentityPolicy::Regenerate)
    }

    /// Load the identity at `path`, generating one according to `policy`.
    pub fn load_or_generate(path: &Path, policy: IdentityPolicy) -> Result<Self, IdentityError> {
        match Self::load(path) {
            Ok(identity) => {
                info!(id = %identity.id(), path = %path.display(), "Loaded identity");
                return Ok(identity);
            }
            Err(IdentityError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No identity found, generating a new one");
            }
            Err(e) if policy == IdentityPolicy::Strict => return Err(e),
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "Identity file unusable, replacing it with a new identity"
                );
            }
        }

        let identity = Self::generate()?;
        identity.save(path)?;
        info!(id = %identity.id(), path = %path.display(), "Saved new identity");
        Ok(identity)
    }

    /// The node's id: unpadded URL-safe base64 of the signing public key.
    pub fn id(&self) -> String {
        encode_id(&self.signing_public_key())
    }

    /// Raw Ed25519 public key bytes.
    pub fn signing_public_key(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Raw X25519 public key bytes.
    pub fn exchange_public_key(&self) -> [u8; EXCHANGE_KEY_LENGTH] {
        self.exchange_public.to_bytes()
    }

    /// Sign `message` with the long-term signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature.
///
/// Only a public key of the wrong size is an error. A key that is not a
/// valid curve point, a malformed signature, or a signature that does not
/// match all return `Ok(false)`.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool, IdentityError> {
    let key: [u8; PUBLIC_KEY_LENGTH] =
        public_key
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: PUBLIC_KEY_LENGTH,
                got: public_key.len(),
            })?;
    let Ok(key) = VerifyingKey::from_bytes(&key) else {
        return Ok(false);
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return Ok(false);
    };
    Ok(key.verify(message, &signature).is_ok())
}

/// Encode raw signing public key bytes as a peer id.
pub fn encode_id(signing_public_key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(signing_public_key)
}

/// Decode a peer id back to raw signing public key bytes.
pub fn decode_id(id: &str) -> Result<[u8; PUBLIC_KEY_LENGTH], IdentityError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(id)
        .map_err(|_| IdentityError::InvalidId(id.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyLength {
            expected: PUBLIC_KEY_LENGTH,
            got: bytes.len(),
        })
}

fn decode_field<const N: usize>(
    name: &str,
    value: &str,
) -> Result<Zeroizing<[u8; N]>, IdentityError> {
    let bytes = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| IdentityError::CorruptIdentity(format!("{name}: {e}")))?,
    );
    if bytes.len() != N {
        return Err(IdentityError::CorruptIdentity(format!(
            "{name}: expected {N} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; N]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}
