//! rippledb - replicated in-memory tuple database
//!
//! Serves the binary protocol, persists every write to the WAL and, when a
//! replication source is configured, follows a master.

use rippledb_core::{Engine, EngineConfig};
use rippledb_server::{
    run_metrics_server, Applier, ApplierConfig, Config, Grants, Metrics, RequestHandler, Server,
    ServerConfig,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // File named by RIPPLEDB_CONFIG (if any), then env overrides and secrets
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("RIPPLEDB_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    let instance_uuid = config.instance.resolve_uuid();
    tracing::info!("Starting rippledb server");
    tracing::info!("  Instance: id {} uuid {}", config.instance.id, instance_uuid);
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());

    let wal_config = config.storage.wal_config();
    std::fs::create_dir_all(&wal_config.dir)?;
    tracing::info!("  WAL directory: {}", wal_config.dir.display());

    let engine = Arc::new(Engine::open(EngineConfig {
        instance_id: config.instance.id,
        wal: wal_config,
    })?);

    let source = config.replication.source.clone();
    match (&source, engine.is_bootstrapped()) {
        (None, false) => {
            engine.bootstrap()?;
            tracing::info!("  Bootstrapped a new dataset");
        }
        (None, true) => tracing::info!("  Recovered vclock {}", engine.vclock()),
        (Some(source), _) => tracing::info!("  Replication source: {}", source),
    }

    let grants = Grants::from_config(&config.auth);
    tracing::info!("  Users: {}", grants.user_count());

    let metrics = if config.metrics.enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    let mut handler = RequestHandler::new(engine.clone(), Arc::new(grants))
        .with_instance_uuid(instance_uuid);
    if let Some(ref metrics) = metrics {
        handler = handler.with_metrics(metrics.clone());
    }
    let handler = Arc::new(handler);
    let server = Arc::new(Server::new(
        ServerConfig::from(&config.network),
        handler.clone(),
    ));

    if let Some(ref metrics) = metrics {
        let addr = config.metrics.bind_addr;
        let metrics = metrics.clone();
        let engine = engine.clone();
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, engine, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
    }

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let applier = match ApplierConfig::from_config(&config.replication, instance_uuid) {
        Some(applier_config) => {
            let handle = Applier::spawn(
                applier_config,
                engine.clone(),
                handler.replication().clone(),
                metrics.clone(),
            );
            let start_timeout = config.replication.start_timeout();
            match handle.wait_started(start_timeout).await {
                Ok(()) => tracing::info!("Replication started, vclock {}", engine.vclock()),
                Err(e) => {
                    tracing::error!("Replication did not start: {}", e);
                    server.shutdown();
                    handle.stop().await;
                    server_task.await??;
                    return Err(e.into());
                }
            }
            Some(handle)
        }
        None => None,
    };

    // Blocks until shutdown
    server_task.await??;

    if let Some(handle) = applier {
        let status = handle.stop().await;
        tracing::info!("Applier stopped at vclock {}", status.vclock);
    }

    // Sync WAL before exit
    if let Err(e) = engine.sync() {
        tracing::error!("Failed to sync WAL on shutdown: {}", e);
    }

    tracing::info!("Server stopped");
    Ok(())
}
