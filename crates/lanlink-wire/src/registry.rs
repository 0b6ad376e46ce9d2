//! Peer registry: known peers, their addresses and live channels.
//!
//! The [`PeerRegistry`] is the single source of truth for peer state. It is
//! cheap to clone and every clone shares the same map. The lock is never held
//! across an await point.

use crate::channel::SecureChannel;
use crate::error::WireError;
use chrono::{DateTime, Utc};
use lanlink_types::identity::{self, EXCHANGE_KEY_LENGTH};
use lanlink_types::IdentityError;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// An unauthenticated discovery observation of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub peer_id: String,
    /// Long-term exchange public key as advertised. Must be 32 bytes.
    pub exchange_public_key: Vec<u8>,
    /// Source address of the announcement.
    pub address: IpAddr,
    /// Advertised service port.
    pub port: u16,
}

impl Sighting {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// What a sighting did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightingOutcome {
    /// First time this peer was seen.
    New,
    /// Known peer, address unchanged (or first learned).
    Refreshed,
    /// Known peer at a new address. Any live channel was closed.
    Moved { closed_channel: bool },
    /// The sighting was of the local node.
    Ignored,
}

/// A single known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: String,
    /// From the latest sighting, or from the handshake of the live channel.
    pub exchange_public_key: [u8; EXCHANGE_KEY_LENGTH],
    /// Dialable address. `None` for peers only ever seen inbound.
    pub address: Option<SocketAddr>,
    /// Last discovery sighting or inbound message.
    pub last_seen: DateTime<Utc>,
    pub channel: Option<Arc<SecureChannel>>,
    /// Who opened `channel`. Set whenever `channel` is.
    pub direction: Option<Direction>,
}

/// Which side opened a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

impl PeerRecord {
    fn new(id: &str, exchange_public_key: [u8; EXCHANGE_KEY_LENGTH]) -> Self {
        Self {
            id: id.to_string(),
            exchange_public_key,
            address: None,
            last_seen: Utc::now(),
            channel: None,
            direction: None,
        }
    }

    fn take_channel(&mut self) -> Option<Arc<SecureChannel>> {
        self.direction = None;
        self.channel.take()
    }

    fn attach(
        &mut self,
        exchange_public_key: [u8; EXCHANGE_KEY_LENGTH],
        channel: Arc<SecureChannel>,
        direction: Direction,
        local_wins_ties: bool,
    ) -> Attached {
        if let (Some(existing), Some(current)) = (self.live_channel(), self.direction) {
            // Crossed dials keep the channel opened by the lower id, on both ends.
            let keep_existing = match (current, direction) {
                (Direction::Inbound, Direction::Inbound) => false,
                (Direction::Outbound, Direction::Outbound) => true,
                (Direction::Outbound, Direction::Inbound) => local_wins_ties,
                (Direction::Inbound, Direction::Outbound) => !local_wins_ties,
            };
            if keep_existing {
                return Attached::Existing(existing);
            }
        }
        self.exchange_public_key = exchange_public_key;
        self.direction = Some(direction);
        match self.channel.replace(channel) {
            Some(old) if old.close() => Attached::Replaced(old),
            _ => Attached::Ours,
        }
    }

    /// The attached channel, if it is still open.
    pub fn live_channel(&self) -> Option<Arc<SecureChannel>> {
        self.channel.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }
}

/// Result of attaching a channel.
#[derive(Debug)]
pub enum Attached {
    /// Our channel is now the peer's channel.
    Ours,
    /// Our channel is now the peer's channel; this live one was closed.
    Replaced(Arc<SecureChannel>),
    /// The live channel already attached stays. Ours was not attached.
    Existing(Arc<SecureChannel>),
}

/// Thread-safe registry of all known peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a discovery sighting.
    ///
    /// A peer seen at a different address than recorded has its live channel
    /// closed and cleared before the address is updated. The exchange key of
    /// a connected peer is left alone, since it came from the authenticated
    /// handshake.
    pub fn register_sighting(&self, sighting: &Sighting) -> Result<SightingOutcome, WireError> {
        let exchange_public_key = validate_sighting(sighting)?;
        let address = sighting.socket_addr();
        let now = Utc::now();

        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let Some(record) = peers.get_mut(&sighting.peer_id) else {
            let mut record = PeerRecord::new(&sighting.peer_id, exchange_public_key);
            record.address = Some(address);
            peers.insert(sighting.peer_id.clone(), record);
            return Ok(SightingOutcome::New);
        };

        record.last_seen = now;
        let outcome = match record.address {
            Some(known) if known != address => {
                let closed_channel = match record.take_channel() {
                    Some(channel) => {
                        channel.close();
                        true
                    }
                    None => false,
                };
                SightingOutcome::Moved { closed_channel }
            }
            _ => SightingOutcome::Refreshed,
        };
        record.address = Some(address);
        if !record.is_connected() {
            record.exchange_public_key = exchange_public_key;
        }
        Ok(outcome)
    }

    /// Attach a channel from an accepted connection, creating the record if
    /// needed.
    ///
    /// An inbound channel replaces an older inbound one, since the remote
    /// reconnected. Against a live outbound channel the tie-break decides:
    /// `local_wins_ties` is true when the local id sorts below the peer's.
    pub fn attach_inbound(
        &self,
        peer_id: &str,
        exchange_public_key: [u8; EXCHANGE_KEY_LENGTH],
        channel: Arc<SecureChannel>,
        local_wins_ties: bool,
    ) -> Attached {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let record = peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerRecord::new(peer_id, exchange_public_key));
        record.last_seen = Utc::now();
        record.attach(exchange_public_key, channel, Direction::Inbound, local_wins_ties)
    }

    /// Attach a channel we dialed to `dialed`.
    ///
    /// Fails with `PeerMoved` if the record's address changed since the dial
    /// started. A live outbound channel always stays; a live inbound one stays
    /// unless the local id wins the tie-break.
    pub fn attach_outbound(
        &self,
        peer_id: &str,
        exchange_public_key: [u8; EXCHANGE_KEY_LENGTH],
        channel: Arc<SecureChannel>,
        dialed: SocketAddr,
        local_wins_ties: bool,
    ) -> Result<Attached, WireError> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let record = peers
            .get_mut(peer_id)
            .ok_or_else(|| WireError::PeerNotFound(peer_id.to_string()))?;
        if record.address != Some(dialed) {
            return Err(WireError::PeerMoved(peer_id.to_string()));
        }
        Ok(record.attach(exchange_public_key, channel, Direction::Outbound, local_wins_ties))
    }

    /// Clear the peer's channel if it is still `channel`. Returns whether it was.
    pub fn detach(&self, peer_id: &str, channel: &Arc<SecureChannel>) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(peer_id) {
            Some(record)
                if record
                    .channel
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, channel)) =>
            {
                record.take_channel();
                true
            }
            _ => false,
        }
    }

    /// Close and clear the peer's channel, keeping the record.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        let channel = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.get_mut(peer_id).and_then(PeerRecord::take_channel)
        };
        match channel {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Close every channel. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let channels: Vec<_> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.values_mut().filter_map(PeerRecord::take_channel).collect()
        };
        channels.iter().filter(|c| c.close()).count()
    }

    /// Record activity from a peer.
    pub fn touch(&self, peer_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = peers.get_mut(peer_id) {
            record.last_seen = Utc::now();
        }
    }

    /// Remove disconnected peers not seen for longer than `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = peers
            .values()
            .filter(|r| !r.is_connected())
            .filter(|r| (now - r.last_seen).to_std().unwrap_or_default() > max_age)
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }

    /// Get a snapshot of a specific peer.
    pub fn get_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(peer_id).cloned()
    }

    /// Get all peers with a live channel.
    pub fn connected_peers(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().filter(|r| r.is_connected()).cloned().collect()
    }

    /// Get all peers (connected + disconnected).
    pub fn all_peers(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().filter(|r| r.is_connected()).count()
    }

    /// Total number of peers (including disconnected).
    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

fn validate_sighting(sighting: &Sighting) -> Result<[u8; EXCHANGE_KEY_LENGTH], WireError> {
    let key: [u8; EXCHANGE_KEY_LENGTH] = sighting
        .exchange_public_key
        .as_slice()
        .try_into()
        .map_err(|_| WireError::InvalidKeyLength {
            what: "exchange public key",
            expected: EXCHANGE_KEY_LENGTH,
            got: sighting.exchange_public_key.len(),
        })?;
    identity::decode_id(&sighting.peer_id).map_err(|e| match e {
        IdentityError::InvalidKeyLength { expected, got } => WireError::InvalidKeyLength {
            what: "peer id",
            expected,
            got,
        },
        other => WireError::Identity(other),
    })?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::SessionKey;
    use lanlink_types::identity::encode_id;

    fn peer_id(n: u8) -> String {
        encode_id(&[n; 32])
    }

    fn make_sighting(n: u8, port: u16) -> Sighting {
        Sighting {
            peer_id: peer_id(n),
            exchange_public_key: vec![n; 32],
            address: "192.168.1.10".parse().unwrap(),
            port,
        }
    }

    fn make_channel() -> Arc<SecureChannel> {
        let (stream, _) = tokio::io::duplex(64);
        Arc::new(SecureChannel::new(stream, &SessionKey::from_bytes([0; 32])))
    }

    #[test]
    fn test_new_sighting_creates_one_record() {
        let registry = PeerRegistry::new();
        let sighting = make_sighting(1, 4000);

        assert_eq!(registry.register_sighting(&sighting).unwrap(), SightingOutcome::New);
        assert_eq!(
            registry.register_sighting(&sighting).unwrap(),
            SightingOutcome::Refreshed
        );
        assert_eq!(registry.total_count(), 1);

        let record = registry.get_peer(&peer_id(1)).unwrap();
        assert_eq!(record.address.unwrap().to_string(), "192.168.1.10:4000");
        assert_eq!(record.exchange_public_key, [1; 32]);
        assert!(!record.is_connected());
    }

    #[test]
    fn test_invalid_sightings_are_rejected() {
        let registry = PeerRegistry::new();

        let mut short_key = make_sighting(1, 4000);
        short_key.exchange_public_key = vec![1; 31];
        assert!(matches!(
            registry.register_sighting(&short_key),
            Err(WireError::InvalidKeyLength { expected: 32, got: 31, .. })
        ));

        let mut bad_id = make_sighting(2, 4000);
        bad_id.peer_id = "not base64!".into();
        assert!(registry.register_sighting(&bad_id).is_err());

        let mut short_id = make_sighting(3, 4000);
        short_id.peer_id = encode_id(&[3; 16]);
        assert!(matches!(
            registry.register_sighting(&short_id),
            Err(WireError::InvalidKeyLength { what: "peer id", .. })
        ));

        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_address_change_closes_channel() {
        let registry = PeerRegistry::new();
        registry.register_sighting(&make_sighting(1, 4000)).unwrap();
        let channel = make_channel();
        registry.attach_inbound(&peer_id(1), [9; 32], Arc::clone(&channel), false);
        assert!(registry.get_peer(&peer_id(1)).unwrap().is_connected());

        let outcome = registry.register_sighting(&make_sighting(1, 4001)).unwrap();
        assert_eq!(outcome, SightingOutcome::Moved { closed_channel: true });
        assert!(channel.is_closed());

        let record = registry.get_peer(&peer_id(1)).unwrap();
        assert!(record.channel.is_none());
        assert_eq!(record.address.unwrap().port(), 4001);
        assert_eq!(record.exchange_public_key, [1; 32]);
    }

    #[test]
    fn test_sighting_keeps_handshake_key_while_connected() {
        let registry = PeerRegistry::new();
        let channel = make_channel();
        registry.attach_inbound(&peer_id(1), [9; 32], Arc::clone(&channel), false);

        // First address learned for an inbound-only peer is not a move.
        let outcome = registry.register_sighting(&make_sighting(1, 4000)).unwrap();
        assert_eq!(outcome, SightingOutcome::Refreshed);
        assert!(!channel.is_closed());

        let record = registry.get_peer(&peer_id(1)).unwrap();
        assert_eq!(record.exchange_public_key, [9; 32]);
        assert!(record.address.is_some());
    }

    #[test]
    fn test_attach_inbound_replaces_existing() {
        let registry = PeerRegistry::new();
        let first = make_channel();
        let second = make_channel();

        assert!(matches!(
            registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&first), false),
            Attached::Ours
        ));
        match registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&second), true) {
            Attached::Replaced(replaced) => assert!(Arc::ptr_eq(&replaced, &first)),
            other => panic!("expected replacement, got {other:?}"),
        }
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_crossed_dials_keep_lower_initiator() {
        let dialed: SocketAddr = "192.168.1.10:4000".parse().unwrap();

        // Local id is lower: our outbound channel wins in either order.
        for inbound_first in [true, false] {
            let registry = PeerRegistry::new();
            registry.register_sighting(&make_sighting(1, 4000)).unwrap();
            let inbound = make_channel();
            let outbound = make_channel();
            if inbound_first {
                registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&inbound), true);
                let attached = registry
                    .attach_outbound(&peer_id(1), [1; 32], Arc::clone(&outbound), dialed, true)
                    .unwrap();
                assert!(matches!(attached, Attached::Replaced(_)));
            } else {
                registry
                    .attach_outbound(&peer_id(1), [1; 32], Arc::clone(&outbound), dialed, true)
                    .unwrap();
                let attached =
                    registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&inbound), true);
                assert!(matches!(attached, Attached::Existing(_)));
            }
            let record = registry.get_peer(&peer_id(1)).unwrap();
            assert!(Arc::ptr_eq(&record.live_channel().unwrap(), &outbound));
            assert_eq!(record.direction, Some(Direction::Outbound));
        }

        // Local id is higher: the remote's dial wins in either order.
        for inbound_first in [true, false] {
            let registry = PeerRegistry::new();
            registry.register_sighting(&make_sighting(1, 4000)).unwrap();
            let inbound = make_channel();
            let outbound = make_channel();
            if inbound_first {
                registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&inbound), false);
                match registry
                    .attach_outbound(&peer_id(1), [1; 32], Arc::clone(&outbound), dialed, false)
                    .unwrap()
                {
                    Attached::Existing(kept) => assert!(Arc::ptr_eq(&kept, &inbound)),
                    other => panic!("live inbound channel was replaced: {other:?}"),
                }
            } else {
                registry
                    .attach_outbound(&peer_id(1), [1; 32], Arc::clone(&outbound), dialed, false)
                    .unwrap();
                let attached =
                    registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&inbound), false);
                assert!(matches!(attached, Attached::Replaced(_)));
            }
            let record = registry.get_peer(&peer_id(1)).unwrap();
            assert!(Arc::ptr_eq(&record.live_channel().unwrap(), &inbound));
            assert_eq!(record.direction, Some(Direction::Inbound));
        }

        assert!(matches!(
            PeerRegistry::new().attach_outbound(&peer_id(7), [2; 32], make_channel(), dialed, true),
            Err(WireError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_outbound_to_old_address_is_refused() {
        let registry = PeerRegistry::new();
        registry.register_sighting(&make_sighting(1, 4000)).unwrap();
        let dialed = registry.get_peer(&peer_id(1)).unwrap().address.unwrap();

        // The peer moves while the dial is in flight.
        assert_eq!(
            registry.register_sighting(&make_sighting(1, 4001)).unwrap(),
            SightingOutcome::Moved {
                closed_channel: false
            }
        );
        assert!(matches!(
            registry.attach_outbound(&peer_id(1), [1; 32], make_channel(), dialed, true),
            Err(WireError::PeerMoved(_))
        ));
        let record = registry.get_peer(&peer_id(1)).unwrap();
        assert!(record.channel.is_none());
        assert_eq!(record.address.unwrap().port(), 4001);
    }

    #[test]
    fn test_detach_only_clears_matching_channel() {
        let registry = PeerRegistry::new();
        let old = make_channel();
        let new = make_channel();
        registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&old), false);
        registry.attach_inbound(&peer_id(1), [1; 32], Arc::clone(&new), false);

        assert!(!registry.detach(&peer_id(1), &old));
        assert!(registry.get_peer(&peer_id(1)).unwrap().is_connected());
        assert!(registry.detach(&peer_id(1), &new));
        let record = registry.get_peer(&peer_id(1)).unwrap();
        assert!(record.channel.is_none());
        assert!(record.direction.is_none());
    }

    #[test]
    fn test_disconnect_and_counts() {
        let registry = PeerRegistry::new();
        registry.attach_inbound(&peer_id(1), [1; 32], make_channel(), false);
        registry.attach_inbound(&peer_id(2), [2; 32], make_channel(), false);
        registry.register_sighting(&make_sighting(3, 4000)).unwrap();
        assert_eq!(registry.connected_count(), 2);
        assert_eq!(registry.total_count(), 3);

        assert!(registry.disconnect(&peer_id(1)));
        assert!(!registry.disconnect(&peer_id(1)));
        assert_eq!(registry.connected_count(), 1);
        assert_eq!(registry.connected_peers()[0].id, peer_id(2));

        assert_eq!(registry.close_all(), 1);
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.all_peers().len(), 3);
    }

    #[test]
    fn test_evict_stale_keeps_connected_and_recent() {
        let registry = PeerRegistry::new();
        registry.register_sighting(&make_sighting(1, 4000)).unwrap();
        registry.register_sighting(&make_sighting(2, 4000)).unwrap();
        registry.attach_inbound(&peer_id(3), [3; 32], make_channel(), false);
        {
            let mut peers = registry.peers.write().unwrap();
            let old = Utc::now() - chrono::Duration::seconds(600);
            peers.get_mut(&peer_id(1)).unwrap().last_seen = old;
            peers.get_mut(&peer_id(3)).unwrap().last_seen = old;
        }

        let evicted = registry.evict_stale(Duration::from_secs(60));
        assert_eq!(evicted, vec![peer_id(1)]);
        assert!(registry.get_peer(&peer_id(2)).is_some());
        assert!(registry.get_peer(&peer_id(3)).is_some());
    }
}
