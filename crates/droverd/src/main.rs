//! droverd — drover orchestration daemon.

use std::sync::Arc;

use anyhow::{Context, Result};

use drover_core::config::DroverConfig;
use drover_core::now_ms;
use drover_services::{
    BlobStore, Datastore, Foreman, FlowRuntime, FsBlobStore, HandlerDispatcher, HuntScheduler,
    MemoryDatastore, MessageHandler, MessageHandlerWorker, ServerContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = DroverConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DroverConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DroverConfig::default()
    });
    tracing::info!(path = %DroverConfig::file_path().display(), "droverd starting");

    // Stores
    let datastore = MemoryDatastore::new();
    let blob_store = FsBlobStore::new(&config.blobs.storage_path)
        .context("failed to open blob store")?;
    tracing::info!(root = %config.blobs.storage_path.display(), "blob store initialized");

    let worker_settings = config.worker.clone();
    let retention_ms = config.flows.retention_ms();

    let ctx = ServerContext::new(
        Arc::new(datastore.clone()) as Arc<dyn Datastore>,
        Arc::new(blob_store.clone()) as Arc<dyn BlobStore>,
        config,
    );

    // Engine
    let flows = FlowRuntime::new(ctx.clone());
    let hunts = HuntScheduler::new(ctx.clone(), flows.clone());
    let foreman = Foreman::new(ctx.clone(), hunts.clone());
    let dispatcher = HandlerDispatcher::new(ctx.clone(), flows.clone(), hunts.clone(), foreman.clone());

    let worker = MessageHandlerWorker::new(ctx.store.clone(), worker_settings.poll_interval());
    worker
        .register_message_handler(
            Arc::new(dispatcher) as Arc<dyn MessageHandler>,
            worker_settings.lease_time(),
            worker_settings.message_handler_batch_limit,
        )
        .context("failed to register message handler")?;
    tracing::info!(owner = worker.owner(), "message handler worker registered");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let maintenance_task = {
        let hunts = hunts.clone();
        let foreman = foreman.clone();
        let flows = flows.clone();
        let mut interval = tokio::time::interval(worker_settings.maintenance_interval());
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let now = now_ms();
                match hunts.refresh_all(now) {
                    Ok(0) => {}
                    Ok(changed) => tracing::info!(changed, "hunts refreshed"),
                    Err(e) => tracing::warn!(error = %e, "hunt refresh failed"),
                }
                if let Err(e) = foreman.expire_rules(now) {
                    tracing::warn!(error = %e, "foreman rule expiry failed");
                }
                if let Some(retention) = retention_ms {
                    if let Err(e) = flows.archive_terminal_flows(retention, now) {
                        tracing::warn!(error = %e, "flow archival failed");
                    }
                }
            }
        })
    };

    let stats_printer = {
        let ctx = ctx.clone();
        let datastore = datastore.clone();
        let blob_store = blob_store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                ctx.blobs.stats().print_stats();
                tracing::info!(
                    pending = datastore.pending_message_handler_requests(),
                    blobs = blob_store.count(),
                    blob_bytes = blob_store.size(),
                    "store snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = maintenance_task    => tracing::error!("maintenance task exited: {:?}", r),
        r = stats_printer       => tracing::error!("stats printer exited: {:?}", r),
    }

    if !worker
        .unregister_message_handler(worker_settings.unregister_timeout())
        .await
    {
        tracing::warn!("in-flight message handler batch abandoned");
    }

    Ok(())
}
