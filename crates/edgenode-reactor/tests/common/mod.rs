// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for edgenode-reactor integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;

use edgenode_reactor::dispatch::{HandlerError, InstructionHandler};
use edgenode_reactor::instruction::{Instruction, InstructionState, InstructionStatus, topics};
use edgenode_reactor::migrations;
use edgenode_reactor::persistence::SqliteInstructionStore;

/// In-memory SQLite store with migrations applied.
pub async fn sqlite_store() -> SqliteInstructionStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    SqliteInstructionStore::new(pool)
}

/// Handler that completes SetControlParameter instructions and counts calls.
pub struct ControlHandler {
    calls: AtomicUsize,
    delay: Duration,
}

impl ControlHandler {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstructionHandler for ControlHandler {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == topics::SET_CONTROL_PARAMETER
    }

    async fn process_instruction(
        &self,
        instruction: &Instruction,
    ) -> Result<Option<InstructionStatus>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Some(
            instruction.create_status(InstructionState::Completed, None),
        ))
    }
}

/// Skip the test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
