// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgenode Reactor - standalone instruction reactor
//!
//! Runs the execution job and cleanup worker against the configured
//! instruction store until interrupted. Handlers for device topics are
//! registered by embedding applications through [`ReactorRuntime`].

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use edgenode_reactor::config::Config;
use edgenode_reactor::persistence::{
    InstructionStore, PostgresInstructionStore, SqliteInstructionStore,
};
use edgenode_reactor::runtime::ReactorRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgenode_reactor=info".parse()?),
        )
        .init();

    info!("Starting Edgenode Reactor");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        poll_interval_secs = config.job.poll_interval.as_secs(),
        maximum_incomplete_hours = config.job.maximum_incomplete_hours,
        cleanup_enabled = config.cleanup.enabled,
        "Configuration loaded"
    );

    info!("Opening instruction store...");
    let store: Arc<dyn InstructionStore> = if config.is_postgres() {
        Arc::new(
            PostgresInstructionStore::connect(&config.database_url)
                .await?
                .with_max_result_param_length(config.max_result_param_length),
        )
    } else {
        let url = config.database_url.as_str();
        let store = if url.starts_with("sqlite:") {
            SqliteInstructionStore::connect(url).await?
        } else {
            SqliteInstructionStore::from_path(url).await?
        };
        Arc::new(store.with_max_result_param_length(config.max_result_param_length))
    };

    if !store.health_check().await? {
        anyhow::bail!("instruction store health check failed");
    }
    info!("Instruction store ready");

    let pending = store.find_instructions_for_acknowledgement().await?;
    info!(pending_acknowledgements = pending.len(), "Loaded instruction backlog");

    let runtime = ReactorRuntime::builder()
        .store(store)
        .job_config(config.job)
        .cleanup_config(config.cleanup)
        .build()?
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
