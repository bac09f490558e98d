// src/main.rs

//! The `ignisd` entry point: the runtime coordination core wired up as a
//! standalone process. Installs the top-level `SignalController`, starts
//! one `PoolManager` per configured worker class, installs the configured
//! HA watcher, and serves `/metrics` until a shutdown signal arrives.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

use ignis_core::config::{Config, HaConfig};
use ignis_core::core::ha::adaptive::{AdaptiveConfig, AdaptiveHa, ClusterProtocol};
use ignis_core::core::ha::uri;
use ignis_core::core::ha::PassiveWatcher;
use ignis_core::core::procpool::{PoolHub, PoolManager, WorkerSpawnSpec};
use ignis_core::core::signalctl::SignalController;
use ignis_core::metrics_server::run_metrics_server;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("ignisd version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Per-module override for the core's most intricate subsystems.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|| {
        format!(
            "{},ignis_core::core::ha=debug,ignis_core::core::supervisor=debug",
            config.log_level
        )
    });
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();
    let _reload_handle = Arc::new(reload_handle);

    if let Err(e) = run_core(config).await {
        error!(error = %e, "ignisd runtime error");
        return Err(e);
    }

    Ok(())
}

struct NoopClusterProtocol;

#[async_trait::async_trait]
impl ClusterProtocol for NoopClusterProtocol {
    async fn on_switch_over(&self) {
        info!("HA watcher declared failover; no local reconfiguration hook is wired up");
    }
}

async fn run_core(config: Config) -> Result<()> {
    let signal_numbers = config.signal_numbers()?;
    let signals = SignalController::install(signal_numbers);
    info!(signals = ?signals.signals(), "signal controller installed");

    std::fs::create_dir_all(&config.runstate_dir)?;

    let mut pool_managers = Vec::with_capacity(config.pools.len());
    for pool_cfg in &config.pools {
        let hub = Arc::new(PoolHub::start(&config.runstate_dir, &pool_cfg.name).await?);
        let spec = WorkerSpawnSpec {
            worker_binary: pool_cfg.worker_binary.clone(),
            cls_name: pool_cfg.cls_name.clone(),
            cls_args_b64: pool_cfg.cls_args_b64.clone(),
            sockname: hub.socket_path().to_path_buf(),
        };
        let manager = PoolManager::with_timeouts(
            hub,
            spec,
            pool_cfg.pool_size,
            config.timeouts.into(),
        );
        manager.start().await?;
        info!(pool = %pool_cfg.name, pool_size = pool_cfg.pool_size, "pool manager started");
        pool_managers.push(manager);
    }

    let protocol: Arc<dyn ClusterProtocol> = Arc::new(NoopClusterProtocol);
    let _ha_adaptive;
    let _ha_passive;
    match &config.ha {
        Some(HaConfig::Adaptive {
            unhealthy_min_time,
            unexpected_disconnects_threshold,
        }) => {
            let ha = AdaptiveHa::new(
                "ignisd",
                AdaptiveConfig {
                    unhealthy_min_time: *unhealthy_min_time,
                    unexpected_disconnects_threshold: *unexpected_disconnects_threshold,
                },
                protocol,
            );
            info!("adaptive HA detector installed");
            _ha_adaptive = Some(ha);
            _ha_passive = None;
        }
        Some(HaConfig::Passive { uri: uri_str }) => {
            let parsed = uri::parse(uri_str)?;
            let watcher = PassiveWatcher::new("ignisd", parsed)?;
            watcher.start_watching(Some(protocol));
            info!(uri = %uri_str, "passive HA watcher installed");
            _ha_adaptive = None;
            _ha_passive = Some(watcher);
        }
        None => {
            _ha_adaptive = None;
            _ha_passive = None;
        }
    }

    let (shutdown_tx, metrics_shutdown_rx) = tokio::sync::broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let port = config.metrics.port;
        Some(tokio::spawn(run_metrics_server(port, metrics_shutdown_rx)))
    } else {
        drop(metrics_shutdown_rx);
        None
    };

    let cancel_on = signals.signals().to_vec();
    let result = signals
        .wait_for(std::future::pending::<ignis_core::core::CoreResult<()>>(), &cancel_on)
        .await;
    match result {
        Err(e) if e.signo().is_some() => {
            info!(signo = ?e.signo(), "received shutdown signal, draining");
        }
        Err(e) => return Err(e.into()),
        Ok(()) => unreachable!("pending future never resolves"),
    }

    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    for manager in &pool_managers {
        manager.stop().await?;
    }

    Ok(())
}
