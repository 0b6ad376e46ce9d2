//! Encrypted, length-framed message channel over a byte stream.
//!
//! Frame layout: `[u16 BE length][12-byte nonce][ciphertext ‖ 16-byte tag]`,
//! where the length counts nonce plus ciphertext. Every frame uses a fresh
//! random nonce under the session key.

use crate::error::WireError;
use crate::handshake::SessionKey;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// AES-GCM nonce size.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag size.
pub const TAG_LEN: usize = 16;
/// Largest frame body the length prefix can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;
/// Largest plaintext that fits in one frame.
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - NONCE_LEN - TAG_LEN;
/// How long [`SecureChannel::shutdown`] waits for an in-flight write.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An authenticated, encrypted channel to one peer.
///
/// Writes are serialized by an internal lock so frames never interleave.
/// Reads are expected from a single receive loop. [`close`](Self::close)
/// wakes any read in progress.
pub struct SecureChannel {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    cipher: Aes256Gcm,
    closed: watch::Sender<bool>,
}

impl SecureChannel {
    /// Take ownership of `stream` and encrypt with `key`.
    pub fn new<S>(stream: S, key: &SessionKey) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            cipher: key.cipher(),
            closed: watch::channel(false).0,
        }
    }

    /// Encrypt and send one message as a single frame.
    pub async fn write(&self, plaintext: &[u8]) -> Result<(), WireError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(WireError::MessageTooLarge {
                size: plaintext.len() + NONCE_LEN + TAG_LEN,
                max: MAX_FRAME_LEN,
            });
        }
        let frame = self.seal(plaintext)?;

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receive and decrypt the next message.
    ///
    /// Returns `ConnectionClosed` on a clean remote EOF or once the channel
    /// is closed locally.
    pub async fn read(&self) -> Result<Vec<u8>, WireError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(WireError::ConnectionClosed);
        }

        let frame = tokio::select! {
            frame = async {
                let mut reader = self.reader.lock().await;
                read_frame(&mut *reader).await
            } => frame?,
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                return Err(WireError::ConnectionClosed);
            }
        };
        self.open(&frame)
    }

    /// Mark the channel closed and wake pending reads. Returns `true` if this
    /// call did the closing.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Close and send FIN to the remote once any in-flight write finishes.
    ///
    /// A write still stuck after [`SHUTDOWN_GRACE`] keeps the stream open
    /// until the channel is dropped.
    pub async fn shutdown(&self) {
        self.close();
        match tokio::time::timeout(SHUTDOWN_GRACE, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "Stream shutdown failed");
                }
            }
            Err(_) => debug!("Write still in flight, skipping stream shutdown"),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireError::Framing("failed to seal frame".into()))?;

        let body_len = NONCE_LEN + ciphertext.len();
        let len = u16::try_from(body_len).map_err(|_| WireError::MessageTooLarge {
            size: body_len,
            max: MAX_FRAME_LEN,
        })?;
        let mut frame = Vec::with_capacity(2 + body_len);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    fn open(&self, frame: &[u8]) -> Result<Vec<u8>, WireError> {
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| WireError::DecryptionFailed)
    }
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Read one frame body (nonce ‖ ciphertext). The u16 prefix caps the body at
/// [`MAX_FRAME_LEN`].
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let len = match reader.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Transport(e)),
    };
    if len < NONCE_LEN + TAG_LEN {
        return Err(WireError::Framing(format!(
            "frame of {len} bytes is shorter than nonce and tag"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
