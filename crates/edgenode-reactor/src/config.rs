// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::cleanup_worker::CleanupWorkerConfig;
use crate::execution_job::ExecutionJobConfig;
use crate::persistence::DEFAULT_MAX_RESULT_PARAM_LENGTH;

/// Edge node reactor configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite or PostgreSQL connection URL
    pub database_url: String,
    /// Execution job settings
    pub job: ExecutionJobConfig,
    /// Maximum stored length of result parameter values
    pub max_result_param_length: usize,
    /// Retention worker settings
    pub cleanup: CleanupWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `EDGENODE_DATABASE_URL`: `sqlite:` path or `postgres://` connection string
    ///
    /// Optional (with defaults):
    /// - `EDGENODE_JOB_POLL_INTERVAL_SECS`: seconds between job passes (default: 10)
    /// - `EDGENODE_MAX_INCOMPLETE_HOURS`: hours before incomplete instructions expire (default: 24)
    /// - `EDGENODE_MAX_RESULT_PARAM_LENGTH`: result value truncation length (default: 1024)
    /// - `EDGENODE_CLEANUP_*`: see [`CleanupWorkerConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("EDGENODE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("EDGENODE_DATABASE_URL"))?;

        let poll_interval_secs: u64 = std::env::var("EDGENODE_JOB_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::Invalid(
                "EDGENODE_JOB_POLL_INTERVAL_SECS",
                "must be a positive integer",
            ))?;

        let maximum_incomplete_hours: u32 = std::env::var("EDGENODE_MAX_INCOMPLETE_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("EDGENODE_MAX_INCOMPLETE_HOURS", "must be a non-negative integer")
            })?;

        let max_result_param_length: usize = match std::env::var("EDGENODE_MAX_RESULT_PARAM_LENGTH") {
            Ok(v) => v.parse::<usize>().ok().filter(|len| *len > 1).ok_or(ConfigError::Invalid(
                "EDGENODE_MAX_RESULT_PARAM_LENGTH",
                "must be an integer greater than 1",
            ))?,
            Err(_) => DEFAULT_MAX_RESULT_PARAM_LENGTH,
        };

        Ok(Self {
            database_url,
            job: ExecutionJobConfig {
                poll_interval: Duration::from_secs(poll_interval_secs),
                maximum_incomplete_hours,
            },
            max_result_param_length,
            cleanup: CleanupWorkerConfig::from_env(),
        })
    }

    /// Whether the database URL points at PostgreSQL.
    pub fn is_postgres(&self) -> bool {
        self.database_url.starts_with("postgres://") || self.database_url.starts_with("postgresql://")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
