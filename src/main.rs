#![cfg_attr(not(test), deny(clippy::panic))]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use scene_sync_node::announcer::Announcer;
use scene_sync_node::config::{self, ServedMapsSetting};
use scene_sync_node::logging;
use scene_sync_node::manager::{RoomManager, ServedPolicy};
use scene_sync_node::metrics::NodeMetrics;
use scene_sync_node::relay::RelayPool;
use scene_sync_node::room::GameEvents;
use scene_sync_node::selector::MapSelector;
use scene_sync_node::signer::Keys;
use scene_sync_node::websocket::{self, AppState};

/// Period of the idle-connection sweep.
const IDLE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Idle authenticated connections are culled after this long.
const MAX_IDLE: Duration = Duration::from_secs(120);

/// Period of the aggregate stats log line.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Scene Sync Node -- real-time multiplayer sync for a grid-partitioned 3D world
#[derive(Parser, Debug)]
#[command(name = "scene-sync-node")]
#[command(about = "A real-time multiplayer sync node for a grid-partitioned 3D world")]
#[command(version)]
struct Cli {
    /// Validate configuration and exit without starting the node.
    /// Useful for CI/CD pipelines and pre-deployment checks.
    #[arg(long, short = 'c', conflicts_with = "print_config")]
    validate_config: bool,

    /// Print the loaded configuration to stdout (as JSON) and exit.
    #[arg(long, conflicts_with = "validate_config")]
    print_config: bool,
}

/// Default presence observer: presence changes become debug log lines.
struct PresenceLogger;

impl GameEvents for PresenceLogger {
    fn peer_joined(&self, map_id: u16, pubkey: &str) {
        tracing::debug!(map_id, pubkey, "Peer joined");
    }
    fn peer_left(&self, map_id: u16, pubkey: &str) {
        tracing::debug!(map_id, pubkey, "Peer left");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(2);
        }
    };

    if cli.print_config {
        let json = serde_json::to_string_pretty(&cfg)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let validation_result = config::validate(&cfg);

    if cli.validate_config {
        match validation_result {
            Ok(()) => {
                println!("Configuration validation passed");
                println!();
                println!("Configuration summary:");
                println!("  Listen: {}:{}", cfg.host, cfg.port);
                println!("  Served maps: {}", cfg.served_maps);
                println!("  Max players: {}", cfg.max_players);
                println!("  Relays: {}", cfg.relays.len());
                println!("  Announcer: {}", if cfg.node_secret_key.is_some() && cfg.sync_url.is_some() { "enabled" } else { "disabled" });
                return Ok(());
            }
            Err(err) => {
                eprintln!("Configuration validation failed:\n{err}");
                std::process::exit(1);
            }
        }
    }

    validation_result?;

    logging::init_with_config(&cfg.logging);

    let metrics = Arc::new(NodeMetrics::new());
    let auto_mode = matches!(cfg.served_maps, ServedMapsSetting::Auto);
    let manager = Arc::new(RoomManager::new(
        ServedPolicy::from_setting(&cfg.served_maps),
        metrics.clone(),
    ));
    manager.set_game_hook(Arc::new(PresenceLogger));
    manager.spawn_reaper();

    // Cancels the periodic supervisor tasks (idle sweep, stats).
    let shutdown = CancellationToken::new();

    {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => manager.cleanup_inactive(MAX_IDLE),
                }
            }
        });
    }

    {
        let manager = manager.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let snapshot = metrics.snapshot();
                        tracing::info!(
                            players = manager.total_player_count(),
                            rooms = manager.active_room_count(),
                            fanned_out = snapshot.messages_fanned_out,
                            heartbeats = snapshot.heartbeats_published,
                            "Node stats"
                        );
                    }
                }
            }
        });
    }

    let announcer = match (&cfg.node_secret_key, &cfg.sync_url) {
        (Some(secret), Some(sync_url)) => {
            let keys = Keys::parse(secret)
                .map_err(|e| anyhow::anyhow!("NODE_SECRET_KEY rejected: {e}"))?;
            tracing::info!(pubkey = keys.public_key(), "Node identity loaded");
            let announcer = Arc::new(Announcer::new(
                RelayPool::new(cfg.relays.clone()),
                manager.clone(),
                keys,
                sync_url.clone(),
                cfg.node_region.clone(),
                cfg.max_players,
                metrics.clone(),
            ));
            announcer.start();
            Some(announcer)
        }
        _ => {
            tracing::info!("Heartbeat announcer disabled (set NODE_SECRET_KEY and SYNC_URL to enable)");
            None
        }
    };

    let selector = if auto_mode {
        let selector = Arc::new(MapSelector::new(
            cfg.relays.clone(),
            manager.clone(),
            cfg.target_maps,
        ));
        selector.start();
        tracing::info!(target_maps = cfg.target_maps, "Map auto-selection enabled");
        Some(selector)
    } else {
        None
    };

    let state = AppState {
        manager: manager.clone(),
        metrics: metrics.clone(),
        max_players: cfg.max_players,
    };
    let router = websocket::create_router().with_state(state);

    let ip: IpAddr = cfg
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("HOST is not a bind address: {e}"))?;
    let addr = SocketAddr::from((ip, cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        served_maps = %cfg.served_maps,
        max_players = cfg.max_players,
        "Scene sync node listening"
    );

    // Graceful teardown: stop timers, stop the selector, publish one offline
    // heartbeat, drain the rooms, then release the listener.
    let drained = CancellationToken::new();
    {
        let drained = drained.clone();
        let shutdown = shutdown.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
            if let Some(selector) = selector {
                selector.stop().await;
            }
            if let Some(announcer) = announcer {
                announcer.stop().await;
            }
            manager.destroy();
            drained.cancel();
        });
    }

    let shutdown_future = {
        let drained = drained.clone();
        async move { drained.cancelled().await }
    };
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_future)
    .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod cli_tests {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn test_cli_default_no_flags() {
        let cli = Cli::try_parse_from(["scene-sync-node"]).unwrap();
        assert!(!cli.validate_config);
        assert!(!cli.print_config);
    }

    #[test]
    fn test_cli_validate_config_flags() {
        let cli = Cli::try_parse_from(["scene-sync-node", "--validate-config"]).unwrap();
        assert!(cli.validate_config);

        let cli = Cli::try_parse_from(["scene-sync-node", "-c"]).unwrap();
        assert!(cli.validate_config);
    }

    #[test]
    fn test_cli_print_config() {
        let cli = Cli::try_parse_from(["scene-sync-node", "--print-config"]).unwrap();
        assert!(cli.print_config);
        assert!(!cli.validate_config);
    }

    #[test]
    fn test_cli_flags_conflict() {
        let result =
            Cli::try_parse_from(["scene-sync-node", "--validate-config", "--print-config"]);
        assert!(result.is_err());
    }
}
