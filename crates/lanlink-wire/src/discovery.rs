//! UDP multicast discovery.
//!
//! Every node periodically multicasts an [`Announcement`] naming its id,
//! long-term exchange key and service port. Received announcements become
//! [`Sighting`]s fed to [`PeerManager::register_discovery`]. The datagram's
//! source address is trusted for the peer's IP; nothing in an announcement
//! is authenticated until the handshake.

use crate::error::WireError;
use crate::manager::PeerManager;
use crate::registry::{Sighting, SightingOutcome};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lanlink_types::{DiscoveryConfig, Identity};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest announcement we expect to receive.
const MAX_DATAGRAM: usize = 2048;

/// A node's self-announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Peer id (encoded signing public key).
    pub id: String,
    /// Encoded long-term exchange public key.
    pub enc: String,
    /// Host name, informational only.
    #[serde(default)]
    pub name: String,
    /// TCP service port.
    pub port: u16,
}

impl Announcement {
    pub fn for_identity(identity: &Identity, name: impl Into<String>, port: u16) -> Self {
        Self {
            id: identity.id(),
            enc: URL_SAFE_NO_PAD.encode(identity.exchange_public_key()),
            name: name.into(),
            port,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Framing(format!("announcement: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::Framing(format!("announcement: {e}")))
    }

    /// Turn into a sighting from `source`. Key size is checked by the registry.
    pub fn into_sighting(self, source: IpAddr) -> Result<Sighting, WireError> {
        let exchange_public_key = URL_SAFE_NO_PAD
            .decode(&self.enc)
            .map_err(|e| WireError::Framing(format!("announcement key: {e}")))?;
        Ok(Sighting {
            peer_id: self.id,
            exchange_public_key,
            address: source,
            port: self.port,
        })
    }
}

/// Apply one received datagram to the manager.
pub fn handle_datagram(
    manager: &PeerManager,
    datagram: &[u8],
    source: IpAddr,
) -> Result<SightingOutcome, WireError> {
    let sighting = Announcement::decode(datagram)?.into_sighting(source)?;
    manager.register_discovery(&sighting)
}

/// Announces this node and listens for others.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    announcement: Announcement,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, announcement: Announcement) -> Self {
        Self {
            config,
            announcement,
        }
    }

    /// Bind the sockets and start the announcer and listener tasks. Both exit
    /// when the manager stops.
    pub async fn spawn(self, manager: Arc<PeerManager>) -> Result<Vec<JoinHandle<()>>, WireError> {
        let group = self.config.multicast_addr;

        let inbound = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).await?;
        inbound.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;

        let outbound = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        outbound.set_multicast_loop_v4(self.config.multicast_loopback)?;

        let payload = self.announcement.encode()?;
        let interval = self.config.announce_interval();
        info!(group = %group, interval = ?interval, "Discovery started");

        let announcer = tokio::spawn(announce_loop(
            outbound,
            SocketAddr::V4(group),
            payload,
            interval,
            Arc::clone(&manager),
        ));
        let listener = tokio::spawn(listen_loop(inbound, manager));
        Ok(vec![announcer, listener])
    }
}

async fn announce_loop(
    socket: UdpSocket,
    group: SocketAddr,
    payload: Vec<u8>,
    interval: Duration,
    manager: Arc<PeerManager>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = manager.stopped() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&payload, group).await {
                    warn!(group = %group, error = %e, "Announcement send failed");
                }
            }
        }
    }
    debug!("Announcer stopped");
}

async fn listen_loop(socket: UdpSocket, manager: Arc<PeerManager>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = manager.stopped() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if let Err(e) = handle_datagram(&manager, &buf[..len], from.ip()) {
                        warn!(from = %from, error = %e, "Rejected discovery datagram");
                    }
                }
                Err(e) => debug!(error = %e, "Discovery receive error"),
            },
        }
    }
    debug!("Discovery listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;

    fn peer_manager() -> Arc<PeerManager> {
        PeerManager::new(
            Arc::new(Identity::generate().unwrap()),
            ManagerConfig::default(),
        )
    }

    #[test]
    fn test_announcement_json_shape() {
        let identity = Identity::generate().unwrap();
        let ann = Announcement::for_identity(&identity, "host-a", 40480);
        let value: serde_json::Value = serde_json::from_slice(&ann.encode().unwrap()).unwrap();

        assert_eq!(value["id"], identity.id());
        assert_eq!(value["name"], "host-a");
        assert_eq!(value["port"], 40480);
        assert_eq!(
            URL_SAFE_NO_PAD.decode(value["enc"].as_str().unwrap()).unwrap(),
            identity.exchange_public_key()
        );
    }

    #[test]
    fn test_sighting_uses_datagram_source() {
        let identity = Identity::generate().unwrap();
        let ann = Announcement::for_identity(&identity, "host-a", 5000);
        let sighting = ann.into_sighting("10.0.0.7".parse().unwrap()).unwrap();

        assert_eq!(sighting.peer_id, identity.id());
        assert_eq!(sighting.socket_addr().to_string(), "10.0.0.7:5000");
        assert_eq!(sighting.exchange_public_key, identity.exchange_public_key());
    }

    #[test]
    fn test_name_is_optional() {
        let ann = Announcement::decode(br#"{"id":"abc","enc":"def","port":1}"#).unwrap();
        assert!(ann.name.is_empty());
    }

    #[tokio::test]
    async fn test_datagrams_register_peers() {
        let mgr = peer_manager();
        let other = Identity::generate().unwrap();
        let datagram = Announcement::for_identity(&other, "b", 4000).encode().unwrap();
        let source: IpAddr = "192.168.0.9".parse().unwrap();

        assert_eq!(
            handle_datagram(&mgr, &datagram, source).unwrap(),
            SightingOutcome::New
        );
        assert_eq!(
            handle_datagram(&mgr, &datagram, source).unwrap(),
            SightingOutcome::Refreshed
        );
        assert_eq!(mgr.registry().total_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_datagrams_are_rejected() {
        let mgr = peer_manager();
        let source: IpAddr = "192.168.0.9".parse().unwrap();

        assert!(matches!(
            handle_datagram(&mgr, b"not json", source),
            Err(WireError::Framing(_))
        ));

        let other = Identity::generate().unwrap();
        let mut ann = Announcement::for_identity(&other, "b", 4000);
        ann.enc = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(matches!(
            handle_datagram(&mgr, &ann.encode().unwrap(), source),
            Err(WireError::InvalidKeyLength { got: 16, .. })
        ));

        let own = Announcement::for_identity(mgr.identity(), "me", 4000);
        assert_eq!(
            handle_datagram(&mgr, &own.encode().unwrap(), source).unwrap(),
            SightingOutcome::Ignored
        );
        assert_eq!(mgr.registry().total_count(), 0);
    }
}
