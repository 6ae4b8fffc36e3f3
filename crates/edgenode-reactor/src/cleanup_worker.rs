// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that removes handled instructions.
//!
//! An instruction is handled once it reached a terminal state and that state
//! was acknowledged upstream (local instructions need no acknowledgement).
//! Handled instructions issued more than `retention_hours` ago are deleted
//! together with their parameters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::ReactorError;
use crate::persistence::InstructionStore;

/// Configuration for the instruction cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Whether cleanup is enabled.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Age in hours after which handled instructions are deleted.
    pub retention_hours: u32,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            retention_hours: 72,
        }
    }
}

impl CleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EDGENODE_CLEANUP_ENABLED`: "true" or "1" to enable (default: false)
    /// - `EDGENODE_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `EDGENODE_CLEANUP_RETENTION_HOURS`: hours to keep handled instructions (default: 72)
    pub fn from_env() -> Self {
        let enabled = std::env::var("EDGENODE_CLEANUP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("EDGENODE_CLEANUP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let retention_hours = std::env::var("EDGENODE_CLEANUP_RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(72);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            retention_hours,
        }
    }
}

/// Background worker that deletes old handled instructions.
pub struct InstructionCleanupWorker {
    store: Arc<dyn InstructionStore>,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl InstructionCleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(store: Arc<dyn InstructionStore>, config: CleanupWorkerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until the shutdown signal is received.
    ///
    /// Returns immediately when cleanup is disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Instruction cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_hours = self.config.retention_hours,
            "Instruction cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Instruction cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_handled_instructions().await {
                        error!(error = %e, "Failed to clean up handled instructions");
                    }
                }
            }
        }

        info!("Instruction cleanup worker stopped");
    }

    /// Run one cleanup cycle, returning the number of deleted instructions.
    pub async fn cleanup_handled_instructions(&self) -> Result<u64, ReactorError> {
        let deleted = self
            .store
            .delete_handled_instructions_older_than(self.config.retention_hours)
            .await?;

        if deleted > 0 {
            info!(
                deleted,
                retention_hours = self.config.retention_hours,
                "Instruction cleanup cycle completed"
            );
        } else {
            debug!("Instruction cleanup cycle completed, no handled instructions found");
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, InstructionState};
    use crate::persistence::MemoryInstructionStore;
    use chrono::Utc;

    #[test]
    fn test_default_config() {
        let config = CleanupWorkerConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.retention_hours, 72);
    }

    #[tokio::test]
    async fn test_disabled_worker_returns_immediately() {
        let store = Arc::new(MemoryInstructionStore::new());
        let worker = InstructionCleanupWorker::new(store, CleanupWorkerConfig::default());

        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .expect("disabled worker should return");
    }

    #[tokio::test]
    async fn test_cleanup_cycle() {
        let store = Arc::new(MemoryInstructionStore::new());
        let old = Utc::now() - chrono::Duration::hours(100);
        let instruction = Instruction::new(1, "server", "Foo", old);
        let status = instruction
            .create_status(InstructionState::Completed, None)
            .with_acknowledged_state(InstructionState::Completed);
        store
            .store_instruction(&instruction.with_status(status))
            .await
            .unwrap();

        let worker = InstructionCleanupWorker::new(
            store.clone(),
            CleanupWorkerConfig {
                enabled: true,
                ..Default::default()
            },
        );

        assert_eq!(worker.cleanup_handled_instructions().await.unwrap(), 1);
        assert!(store.is_empty());
        assert_eq!(worker.cleanup_handled_instructions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryInstructionStore::new());
        let worker = Arc::new(InstructionCleanupWorker::new(
            store,
            CleanupWorkerConfig {
                enabled: true,
                poll_interval: Duration::from_millis(10),
                retention_hours: 1,
            },
        ));

        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
