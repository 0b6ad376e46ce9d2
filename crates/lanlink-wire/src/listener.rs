//! TCP listener that hands inbound connections to the [`PeerManager`].

use crate::error::WireError;
use crate::manager::PeerManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Accepts peer connections on the service port.
pub struct Listener {
    listener: TcpListener,
    manager: Arc<PeerManager>,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind the service port.
    pub async fn bind(addr: SocketAddr, manager: Arc<PeerManager>) -> Result<Self, WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, id = %manager.local_id(), "Listening for peers");
        Ok(Self {
            listener,
            manager,
            local_addr,
        })
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until the manager stops.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop())
    }

    async fn accept_loop(self) {
        loop {
            tokio::select! {
                _ = self.manager.stopped() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "Accepted connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let manager = Arc::clone(&self.manager);
                        tokio::spawn(async move {
                            if let Err(e) = manager.accept(stream, Some(addr)).await {
                                warn!(addr = %addr, error = %e, "Inbound handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
            }
        }
        info!(addr = %self.local_addr, "Listener stopped");
    }
}
