//! `lanlink run`: the long-running node.

use crate::config::{apply_env_overrides, load_config};
use anyhow::Context;
use lanlink_types::Identity;
use lanlink_wire::{Announcement, DiscoveryService, Listener, ManagerConfig, PeerManager, PeerRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub fn cmd_run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(run(config_path))
}

async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = load_config(config_path);
    apply_env_overrides(&mut config);

    let identity = Identity::load_or_generate(&config.identity_path, config.identity_policy())
        .with_context(|| {
            format!(
                "Failed to load identity from {}",
                config.identity_path.display()
            )
        })?;
    let identity = Arc::new(identity);

    let manager = PeerManager::new(
        Arc::clone(&identity),
        ManagerConfig {
            handshake_timeout: config.network.handshake_timeout(),
        },
    );
    manager.on_message(|peer, payload| {
        println!("[{}] {}", short_id(peer), String::from_utf8_lossy(&payload));
    });
    manager.on_disconnect(|peer| {
        println!("* {} disconnected", short_id(peer));
    });

    let listener = Listener::bind(config.network.listen_socket_addr(), Arc::clone(&manager))
        .await
        .context("Failed to bind service port")?;
    let port = listener.local_addr().port();
    listener.spawn();

    if config.discovery.enabled {
        let announcement = Announcement::for_identity(&identity, host_name(), port);
        DiscoveryService::new(config.discovery.clone(), announcement)
            .spawn(Arc::clone(&manager))
            .await
            .context("Failed to start discovery")?;
    }
    if let Some(ttl) = config.discovery.peer_ttl() {
        spawn_sweeper(Arc::clone(&manager), ttl, config.discovery.sweep_interval());
    }

    println!("lanlink node {} on port {port}", identity.id());
    println!("Type `<peer-id> <message>` to send, `peers` to list. Ctrl+C to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&manager, line.trim()).await,
                Ok(None) => {
                    // Stdin closed; keep serving until interrupted.
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
            },
        }
    }

    info!("Shutting down");
    manager.stop();
    Ok(())
}

async fn handle_line(manager: &PeerManager, line: &str) {
    if line.is_empty() {
        return;
    }
    if line == "peers" {
        print_peers(manager.registry());
        return;
    }

    let Some((target, text)) = line.split_once(char::is_whitespace) else {
        println!("usage: <peer-id> <message> | peers");
        return;
    };
    let peer_id = match resolve_peer(manager.registry(), target) {
        Ok(id) => id,
        Err(msg) => {
            println!("{msg}");
            return;
        }
    };
    if let Err(e) = manager.send(&peer_id, text.trim_start().as_bytes()).await {
        println!("send to {} failed: {e}", short_id(&peer_id));
    }
}

/// Resolve a full id or a unique id prefix against known peers.
fn resolve_peer(registry: &PeerRegistry, prefix: &str) -> Result<String, String> {
    let ids: Vec<String> = registry
        .all_peers()
        .into_iter()
        .map(|p| p.id)
        .filter(|id| id.starts_with(prefix))
        .collect();
    if ids.iter().any(|id| id == prefix) {
        return Ok(prefix.to_string());
    }
    match ids.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(format!("no known peer matches '{prefix}'")),
        _ => Err(format!("'{prefix}' matches {} peers", ids.len())),
    }
}

fn print_peers(registry: &PeerRegistry) {
    let mut peers = registry.all_peers();
    if peers.is_empty() {
        println!("no peers yet");
        return;
    }
    peers.sort_by(|a, b| a.id.cmp(&b.id));
    for peer in peers {
        let addr = peer
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if peer.is_connected() { "connected" } else { "idle" };
        println!(
            "{}  {:<21}  {:<9}  last seen {}",
            peer.id,
            addr,
            state,
            peer.last_seen.format("%H:%M:%S")
        );
    }
}

fn spawn_sweeper(manager: Arc<PeerManager>, ttl: Duration, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = manager.stopped() => break,
                _ = ticker.tick() => {
                    let evicted = manager.evict_stale(ttl);
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "Evicted stale peers");
                    }
                }
            }
        }
    });
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "lanlink".to_string())
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
