//! Configuration types loaded from `~/.lanlink/config.toml`.
//!
//! Every field has a default, so an empty or partial file is valid.

use crate::identity::IdentityPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Default TCP service port.
pub const DEFAULT_SERVICE_PORT: u16 = 40480;

/// Default multicast group for discovery announcements.
pub const DEFAULT_MULTICAST_ADDR: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 250), 40400);

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanlinkConfig {
    /// Where the node identity is stored.
    pub identity_path: PathBuf,
    /// Refuse to replace an identity file that exists but cannot be loaded.
    pub strict_identity: bool,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for LanlinkConfig {
    fn default() -> Self {
        Self {
            identity_path: lanlink_home().join("identity.json"),
            strict_identity: false,
            network: NetworkConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl LanlinkConfig {
    /// Identity load policy implied by `strict_identity`.
    pub fn identity_policy(&self) -> IdentityPolicy {
        if self.strict_identity {
            IdentityPolicy::Strict
        } else {
            IdentityPolicy::Regenerate
        }
    }
}

/// TCP listener and handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind the service listener on.
    pub listen_addr: IpAddr,
    /// Service port, advertised in discovery announcements.
    pub service_port: u16,
    /// Upper bound on a single handshake.
    pub handshake_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            service_port: DEFAULT_SERVICE_PORT,
            handshake_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.service_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// UDP multicast discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Multicast group and port announcements are sent to.
    pub multicast_addr: SocketAddrV4,
    /// Seconds between announcements.
    pub announce_interval_secs: u64,
    /// Deliver our own announcements to other processes on this host.
    pub multicast_loopback: bool,
    /// Disconnected peers not seen for this long are evicted. 0 keeps them forever.
    pub peer_ttl_secs: u64,
    /// Seconds between eviction sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multicast_addr: DEFAULT_MULTICAST_ADDR,
            announce_interval_secs: 3,
            multicast_loopback: false,
            peer_ttl_secs: 0,
            sweep_interval_secs: 60,
        }
    }
}

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }

    /// `None` when eviction is disabled.
    pub fn peer_ttl(&self) -> Option<Duration> {
        (self.peer_ttl_secs > 0).then(|| Duration::from_secs(self.peer_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// `~/.lanlink`, or `.lanlink` in the working directory without a home.
pub fn lanlink_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".lanlink"))
        .unwrap_or_else(|| PathBuf::from(".lanlink"))
}
