//! Daemon mode: engine workers plus the cron scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::services::{CronScheduler, TaskEngine};

/// Run until interrupted, then drain in-flight work.
pub async fn handle_serve(
    engine: Arc<TaskEngine>,
    scheduler: Arc<CronScheduler>,
) -> Result<()> {
    engine.start().await.context("Failed to start engine")?;

    let shutdown = CancellationToken::new();
    let scheduler_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown signal received; draining");

    shutdown.cancel();
    engine.drain(Duration::from_secs(30)).await;
    engine.shutdown();
    let _ = scheduler_handle.await;

    info!("daemon stopped");
    Ok(())
}
