//! PeerManager: establishes, owns and tears down secure channels.
//!
//! A [`PeerManager`] turns discovery sightings into registry records, dials
//! peers on demand, accepts inbound connections, and runs one receive loop
//! per live channel. Inbound messages and disconnects are delivered to the
//! registered callbacks from a single dispatcher task, so callbacks run one
//! at a time and never while the registry is locked.
//!
//! When both sides dial each other at once, both ends keep the channel
//! opened by the node with the lower id and close the other, so the pair
//! converges on a single channel.

use crate::channel::SecureChannel;
use crate::error::WireError;
use crate::handshake::{self, HandshakeOutcome, Role};
use crate::registry::{Attached, PeerRegistry, Sighting, SightingOutcome};
use dashmap::DashMap;
use lanlink_types::Identity;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Redials allowed when the peer moves mid-dial.
const MAX_MOVED_REDIALS: usize = 2;

/// Callback for inbound messages: `(sender_id, payload)`.
pub type MessageCallback = Arc<dyn Fn(&str, Vec<u8>) + Send + Sync>;
/// Callback for lost channels: `(peer_id)`.
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bound on dialing and on the handshake, each.
    pub handshake_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

enum PeerEvent {
    Message { peer_id: String, payload: Vec<u8> },
    Disconnected { peer_id: String },
}

#[derive(Default)]
struct Handlers {
    on_message: Option<MessageCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

/// Owns every secure channel of the local node.
pub struct PeerManager {
    identity: Arc<Identity>,
    config: ManagerConfig,
    registry: PeerRegistry,
    running: watch::Sender<bool>,
    handlers: Arc<RwLock<Handlers>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    /// One dial at a time per peer.
    dialing: DashMap<String, Arc<Mutex<()>>>,
}

impl PeerManager {
    /// Create a manager and start its dispatcher task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(identity: Arc<Identity>, config: ManagerConfig) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(RwLock::new(Handlers::default()));
        tokio::spawn(dispatch_loop(rx, Arc::clone(&handlers)));

        Arc::new(Self {
            identity,
            config,
            registry: PeerRegistry::new(),
            running: watch::channel(true).0,
            handlers,
            events,
            dialing: DashMap::new(),
        })
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// The local node's id.
    pub fn local_id(&self) -> String {
        self.identity.id()
    }

    /// Get a reference to the peer registry.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    /// Register the callback for inbound messages, replacing any previous one.
    ///
    /// Messages that arrive while no callback is registered are dropped.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&str, Vec<u8>) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.on_message = Some(Arc::new(callback));
    }

    /// Register the callback for lost channels, replacing any previous one.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.on_disconnect = Some(Arc::new(callback));
    }

    /// Record a discovery sighting. Sightings of the local node are ignored.
    pub fn register_discovery(&self, sighting: &Sighting) -> Result<SightingOutcome, WireError> {
        if sighting.peer_id == self.local_id() {
            return Ok(SightingOutcome::Ignored);
        }
        let outcome = self.registry.register_sighting(sighting)?;
        match outcome {
            SightingOutcome::New => {
                info!(peer = %sighting.peer_id, addr = %sighting.socket_addr(), "Discovered peer");
            }
            SightingOutcome::Moved { closed_channel } => {
                info!(
                    peer = %sighting.peer_id,
                    addr = %sighting.socket_addr(),
                    closed_channel,
                    "Peer moved"
                );
            }
            SightingOutcome::Refreshed | SightingOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Return the live channel to `peer_id`, dialing and handshaking if needed.
    ///
    /// If the peer is sighted at a new address while the dial is in flight,
    /// the dialed channel is dropped and the new address is dialed instead.
    pub async fn connect(&self, peer_id: &str) -> Result<Arc<SecureChannel>, WireError> {
        if !self.is_running() {
            return Err(WireError::ShuttingDown);
        }
        if let Some(channel) = self.known_peer_channel(peer_id)? {
            return Ok(channel);
        }

        let guard = self
            .dialing
            .entry(peer_id.to_string())
            .or_default()
            .value()
            .clone();
        let _dialing = guard.lock().await;

        let mut redials = 0;
        loop {
            // A concurrent dial or an inbound connection may have won meanwhile.
            let record = self
                .registry
                .get_peer(peer_id)
                .ok_or_else(|| WireError::PeerNotFound(peer_id.to_string()))?;
            if let Some(channel) = record.live_channel() {
                return Ok(channel);
            }
            let addr = record
                .address
                .ok_or_else(|| WireError::Unreachable(peer_id.to_string()))?;

            match self.dial(peer_id, addr).await {
                Err(WireError::PeerMoved(_)) if redials < MAX_MOVED_REDIALS => {
                    redials += 1;
                    info!(peer = %peer_id, old_addr = %addr, "Peer moved during dial, redialing");
                }
                result => return result,
            }
        }
    }

    /// Run the responder handshake on an accepted connection and attach the
    /// resulting channel. Returns the peer id.
    ///
    /// The new channel replaces an earlier inbound one. When it crosses our
    /// own dial, the channel opened by the lower id is kept on both ends. On
    /// failure the stream is dropped.
    pub async fn accept<S>(
        &self,
        mut stream: S,
        remote_addr: Option<SocketAddr>,
    ) -> Result<String, WireError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let label = remote_addr.map_or_else(|| "inbound".to_string(), |a| a.to_string());
        if !self.is_running() {
            return Err(WireError::ShuttingDown);
        }

        let outcome = self
            .handshake(&mut stream, Role::Responder)
            .await
            .map_err(|e| WireError::handshake(label.as_str(), e))?;
        if outcome.remote_id == self.local_id() {
            return Err(WireError::handshake(label, WireError::SelfConnection));
        }
        if !self.is_running() {
            return Err(WireError::ShuttingDown);
        }

        let peer_id = outcome.remote_id.clone();
        let channel = Arc::new(SecureChannel::new(stream, &outcome.session_key));
        match self.registry.attach_inbound(
            &peer_id,
            outcome.remote_exchange_key,
            Arc::clone(&channel),
            self.local_wins_ties(&peer_id),
        ) {
            Attached::Existing(_) => {
                debug!(peer = %peer_id, "Keeping our dialed channel, dropping accepted one");
                channel.shutdown().await;
                return Ok(peer_id);
            }
            Attached::Replaced(_) => {
                debug!(peer = %peer_id, "Inbound channel replaced an existing one");
            }
            Attached::Ours => {}
        }
        info!(peer = %peer_id, addr = %label, "Accepted secure channel");
        self.spawn_receive_loop(peer_id.clone(), channel);
        Ok(peer_id)
    }

    /// Send one message to `peer_id`, connecting first if needed.
    ///
    /// A channel closed because a crossed dial replaced it is retried once on
    /// its replacement. A failed write closes the channel so its receive loop
    /// reports the disconnect. An oversize message leaves the channel
    /// untouched.
    pub async fn send(&self, peer_id: &str, payload: &[u8]) -> Result<(), WireError> {
        let mut channel = self.connect(peer_id).await?;
        let mut result = channel.write(payload).await;
        if matches!(result, Err(WireError::ConnectionClosed)) {
            let replacement = self
                .known_peer_channel(peer_id)?
                .filter(|current| !Arc::ptr_eq(current, &channel));
            if let Some(current) = replacement {
                debug!(peer = %peer_id, "Channel was replaced, sending on the new one");
                result = current.write(payload).await;
                channel = current;
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(e @ WireError::MessageTooLarge { .. }) => Err(e),
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Send failed, closing channel");
                channel.close();
                Err(e)
            }
        }
    }

    /// Close the channel to `peer_id`, keeping its record. Returns whether a
    /// channel was attached.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        self.registry.disconnect(peer_id)
    }

    /// Remove disconnected peers not seen within `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<String> {
        let evicted = self.registry.evict_stale(max_age);
        for peer_id in &evicted {
            self.dialing.remove(peer_id);
            debug!(peer = %peer_id, "Evicted stale peer");
        }
        evicted
    }

    /// Stop the manager: close every channel and refuse new ones.
    ///
    /// The listener and discovery tasks watch the same flag and exit.
    pub fn stop(&self) {
        if self.running.send_replace(false) {
            let closed = self.registry.close_all();
            info!(closed, "Peer manager stopped");
        }
    }

    /// Dial `addr`, authenticate it as `peer_id` and attach the channel.
    async fn dial(&self, peer_id: &str, addr: SocketAddr) -> Result<Arc<SecureChannel>, WireError> {
        info!(peer = %peer_id, addr = %addr, "Connecting to peer");
        let mut stream = tokio::time::timeout(self.config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout)??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let outcome = self
            .handshake(&mut stream, Role::Initiator)
            .await
            .map_err(|e| WireError::handshake(peer_id, e))?;
        if outcome.remote_id != peer_id {
            return Err(WireError::handshake(
                peer_id,
                WireError::IdentityMismatch {
                    expected: peer_id.to_string(),
                    actual: outcome.remote_id,
                },
            ));
        }
        if !self.is_running() {
            return Err(WireError::ShuttingDown);
        }

        let channel = Arc::new(SecureChannel::new(stream, &outcome.session_key));
        let attached = self.registry.attach_outbound(
            peer_id,
            outcome.remote_exchange_key,
            Arc::clone(&channel),
            addr,
            self.local_wins_ties(peer_id),
        );
        match attached {
            Ok(Attached::Ours) | Ok(Attached::Replaced(_)) => {
                info!(peer = %peer_id, addr = %addr, "Secure channel established");
                self.spawn_receive_loop(peer_id.to_string(), Arc::clone(&channel));
                Ok(channel)
            }
            Ok(Attached::Existing(existing)) => {
                debug!(peer = %peer_id, "Keeping existing channel, dropping dialed one");
                channel.shutdown().await;
                Ok(existing)
            }
            Err(e) => {
                channel.shutdown().await;
                Err(e)
            }
        }
    }

    /// Crossed dials keep the channel opened by the lower id.
    fn local_wins_ties(&self, peer_id: &str) -> bool {
        self.local_id().as_str() < peer_id
    }

    fn known_peer_channel(&self, peer_id: &str) -> Result<Option<Arc<SecureChannel>>, WireError> {
        self.registry
            .get_peer(peer_id)
            .map(|record| record.live_channel())
            .ok_or_else(|| WireError::PeerNotFound(peer_id.to_string()))
    }

    async fn handshake<S>(&self, stream: &mut S, role: Role) -> Result<HandshakeOutcome, WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::perform(stream, &self.identity, role),
        )
        .await
        .map_err(|_| WireError::Timeout)?
    }

    fn spawn_receive_loop(&self, peer_id: String, channel: Arc<SecureChannel>) {
        tokio::spawn(receive_loop(
            peer_id,
            channel,
            self.registry.clone(),
            self.events.clone(),
            self.running.subscribe(),
        ));
    }
}

/// Read frames until the channel fails, then detach it and report the loss.
async fn receive_loop(
    peer_id: String,
    channel: Arc<SecureChannel>,
    registry: PeerRegistry,
    events: mpsc::UnboundedSender<PeerEvent>,
    running: watch::Receiver<bool>,
) {
    while *running.borrow() {
        match channel.read().await {
            Ok(payload) => {
                registry.touch(&peer_id);
                debug!(peer = %peer_id, bytes = payload.len(), "Received message");
                let event = PeerEvent::Message {
                    peer_id: peer_id.clone(),
                    payload,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(WireError::ConnectionClosed) => break,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Channel failed");
                break;
            }
        }
    }

    channel.shutdown().await;
    registry.detach(&peer_id, &channel);
    if registry.get_peer(&peer_id).is_some_and(|r| r.is_connected()) {
        debug!(peer = %peer_id, "Replaced channel closed");
        return;
    }
    info!(peer = %peer_id, "Peer disconnected");
    let _ = events.send(PeerEvent::Disconnected { peer_id });
}

async fn dispatch_loop(mut events: mpsc::UnboundedReceiver<PeerEvent>, handlers: Arc<RwLock<Handlers>>) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Message { peer_id, payload } => {
                let callback = handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_message
                    .clone();
                match callback {
                    Some(callback) => callback(&peer_id, payload),
                    None => debug!(peer = %peer_id, "No message handler, dropping message"),
                }
            }
            PeerEvent::Disconnected { peer_id } => {
                let callback = handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_disconnect
                    .clone();
                if let Some(callback) = callback {
                    callback(&peer_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn manager() -> Arc<PeerManager> {
        PeerManager::new(
            Arc::new(Identity::generate().unwrap()),
            ManagerConfig::default(),
        )
    }

    fn sighting_for(identity: &Identity, port: u16) -> Sighting {
        Sighting {
            peer_id: identity.id(),
            exchange_public_key: identity.exchange_public_key().to_vec(),
            address: Ipv4Addr::LOCALHOST.into(),
            port,
        }
    }

    #[tokio::test]
    async fn test_own_sighting_is_ignored() {
        let mgr = manager();
        let own = sighting_for(mgr.identity(), 4000);
        assert_eq!(mgr.register_discovery(&own).unwrap(), SightingOutcome::Ignored);
        assert_eq!(mgr.registry().total_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_unknown_peer() {
        let mgr = manager();
        let other = Identity::generate().unwrap();
        assert!(matches!(
            mgr.connect(&other.id()).await,
            Err(WireError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_over_duplex_attaches_channel() {
        let a = manager();
        let b = manager();
        b.register_discovery(&sighting_for(a.identity(), 1)).unwrap();

        let (left, right) = tokio::io::duplex(64 * 1024);
        let (accepted, dialed) = tokio::join!(a.accept(right, None), async {
            let mut left = left;
            handshake::perform(&mut left, b.identity(), Role::Initiator)
                .await
                .map(|outcome| (left, outcome))
        });

        assert_eq!(accepted.unwrap(), b.local_id());
        let (stream, outcome) = dialed.unwrap();
        assert_eq!(outcome.remote_id, a.local_id());
        assert_eq!(a.registry().connected_count(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.on_message(move |peer, payload| {
            let _ = tx.send((peer.to_string(), payload));
        });
        let channel = SecureChannel::new(stream, &outcome.session_key);
        channel.write(b"hi").await.unwrap();

        let (from, payload) = rx.recv().await.unwrap();
        assert_eq!(from, b.local_id());
        assert_eq!(payload, b"hi");
    }

    async fn dial_in(
        target: &PeerManager,
        dialer: &Identity,
    ) -> (tokio::io::DuplexStream, HandshakeOutcome) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (accepted, dialed) = tokio::join!(target.accept(right, None), async {
            let mut left = left;
            handshake::perform(&mut left, dialer, Role::Initiator)
                .await
                .map(|outcome| (left, outcome))
        });
        assert_eq!(accepted.unwrap(), dialer.id());
        dialed.unwrap()
    }

    #[tokio::test]
    async fn test_replaced_channel_does_not_report_disconnect() {
        let a = manager();
        let b = Identity::generate().unwrap();
        let (tx, mut losses) = mpsc::unbounded_channel();
        a.on_disconnect(move |peer| {
            let _ = tx.send(peer.to_string());
        });

        let (_first, _) = dial_in(&a, &b).await;
        let first_channel = a.registry().get_peer(&b.id()).unwrap().live_channel().unwrap();
        let (second, _) = dial_in(&a, &b).await;
        assert!(first_channel.is_closed());
        assert_eq!(a.registry().connected_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(losses.try_recv().is_err());

        drop(second);
        let lost = tokio::time::timeout(Duration::from_secs(2), losses.recv())
            .await
            .expect("no disconnect reported")
            .unwrap();
        assert_eq!(lost, b.id());
        assert_eq!(a.registry().connected_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_manager_refuses_work() {
        let mgr = manager();
        let other = Identity::generate().unwrap();
        mgr.register_discovery(&sighting_for(&other, 4000)).unwrap();
        mgr.stop();
        mgr.stop();

        assert!(!mgr.is_running());
        assert!(matches!(mgr.connect(&other.id()).await, Err(WireError::ShuttingDown)));
        let (_left, right) = tokio::io::duplex(64);
        assert!(matches!(mgr.accept(right, None).await, Err(WireError::ShuttingDown)));
    }
}
