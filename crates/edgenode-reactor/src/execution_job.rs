// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic instruction execution job.
//!
//! Each pass runs two scans over the instruction store:
//!
//! 1. **Received**: claim each instruction with a compare-and-set to
//!    `Executing`, dispatch it, then commit the handler's terminal status with a
//!    compare-and-set from `Executing`. Unhandled instructions are rolled
//!    back to their original `Received` status so a later pass can retry,
//!    unless they are already past the incomplete limit, in which case they
//!    are declined as expired.
//! 2. **Executing**: decline instructions stuck in `Executing` past the
//!    incomplete limit (for example after a crash mid-dispatch).
//!
//! Only the winner of a compare-and-set acts, so passes running concurrently
//! against the same store never dispatch an instruction twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dispatch::InstructionExecutionService;
use crate::error::ReactorError;
use crate::instruction::{
    ERROR_CODE_INSTRUCTION_EXPIRED, Instruction, InstructionState, InstructionStatus, error_result,
};
use crate::persistence::InstructionStore;

/// Configuration for the instruction execution job.
#[derive(Debug, Clone)]
pub struct ExecutionJobConfig {
    /// How often to run a pass.
    pub poll_interval: Duration,
    /// Hours an instruction may remain incomplete before it is declined.
    pub maximum_incomplete_hours: u32,
}

impl Default for ExecutionJobConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            maximum_incomplete_hours: 24,
        }
    }
}

/// Counters describing what a single pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobPassSummary {
    /// Instructions moved from Received to Executing by this pass.
    pub claimed: usize,
    /// Claimed instructions committed as Completed.
    pub completed: usize,
    /// Claimed instructions committed as Declined by their handler.
    pub declined: usize,
    /// Claimed instructions returned to Received for a later retry.
    pub rolled_back: usize,
    /// Instructions declined because they exceeded the incomplete limit.
    pub expired: usize,
    /// Compare-and-set operations lost to another writer.
    pub races_lost: usize,
}

/// Background job that dispatches received instructions and reaps stalled ones.
pub struct InstructionExecutionJob {
    store: Arc<dyn InstructionStore>,
    executor: Arc<dyn InstructionExecutionService>,
    config: ExecutionJobConfig,
    shutdown: Arc<Notify>,
}

impl InstructionExecutionJob {
    /// Create a new execution job.
    pub fn new(
        store: Arc<dyn InstructionStore>,
        executor: Arc<dyn InstructionExecutionService>,
        config: ExecutionJobConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the job loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            maximum_incomplete_hours = self.config.maximum_incomplete_hours,
            "Instruction execution job started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Instruction execution job received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let summary = self.execute_job().await;
                    if summary != JobPassSummary::default() {
                        debug!(?summary, "Instruction execution pass finished");
                    }
                }
            }
        }

        info!("Instruction execution job stopped");
    }

    /// Run a single pass over the store.
    pub async fn execute_job(&self) -> JobPassSummary {
        let mut summary = JobPassSummary::default();
        self.execute_received(&mut summary).await;
        self.expire_executing(&mut summary).await;
        summary
    }

    async fn execute_received(&self, summary: &mut JobPassSummary) {
        let instructions = match self
            .store
            .find_instructions_for_state(InstructionState::Received)
            .await
        {
            Ok(instructions) => instructions,
            Err(e) => {
                error!(error = %e, "Failed to find received instructions");
                return;
            }
        };

        for instruction in instructions {
            if let Err(e) = self.execute_instruction(&instruction, summary).await {
                error!(
                    instruction_id = instruction.id(),
                    instructor_id = %instruction.instructor_id(),
                    error = %e,
                    "Failed to execute instruction"
                );
            }
        }
    }

    async fn execute_instruction(
        &self,
        instruction: &Instruction,
        summary: &mut JobPassSummary,
    ) -> Result<(), ReactorError> {
        let original = instruction.initial_status();
        let executing = instruction.create_status(InstructionState::Executing, None);
        if !self
            .cas(instruction, InstructionState::Received, &executing)
            .await?
        {
            summary.races_lost += 1;
            debug!(
                instruction_id = instruction.id(),
                instructor_id = %instruction.instructor_id(),
                "Instruction claimed by another worker"
            );
            return Ok(());
        }
        summary.claimed += 1;

        let claimed = instruction.clone().with_status(executing);
        let result = match self.executor.execute_instruction(&claimed).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    instruction_id = instruction.id(),
                    topic = %instruction.topic(),
                    error = %e,
                    "Instruction execution failed"
                );
                None
            }
        };
        let result = result.filter(|status| {
            let terminal = status.state().is_terminal();
            if !terminal {
                warn!(
                    instruction_id = instruction.id(),
                    topic = %instruction.topic(),
                    state = %status.state(),
                    "Handler returned a non-terminal status; treating instruction as unhandled"
                );
            }
            terminal
        });

        match result {
            Some(status) => {
                let state = status.state();
                if self
                    .cas(instruction, InstructionState::Executing, &status)
                    .await?
                {
                    if state == InstructionState::Completed {
                        summary.completed += 1;
                    } else {
                        summary.declined += 1;
                    }
                    info!(
                        instruction_id = instruction.id(),
                        instructor_id = %instruction.instructor_id(),
                        topic = %instruction.topic(),
                        state = %state,
                        "Instruction executed"
                    );
                } else {
                    summary.races_lost += 1;
                    debug!(
                        instruction_id = instruction.id(),
                        "Instruction changed while executing; result discarded"
                    );
                }
            }
            None if self.is_expired(original.status_date()) => {
                if self
                    .cas(instruction, InstructionState::Executing, &self.expired_status(instruction))
                    .await?
                {
                    summary.expired += 1;
                    warn!(
                        instruction_id = instruction.id(),
                        topic = %instruction.topic(),
                        "No handler executed instruction before it expired; declined"
                    );
                } else {
                    summary.races_lost += 1;
                }
            }
            None => {
                if self
                    .cas(instruction, InstructionState::Executing, &original)
                    .await?
                {
                    summary.rolled_back += 1;
                    debug!(
                        instruction_id = instruction.id(),
                        topic = %instruction.topic(),
                        "No handler executed instruction; returned to Received"
                    );
                } else {
                    summary.races_lost += 1;
                }
            }
        }

        Ok(())
    }

    async fn expire_executing(&self, summary: &mut JobPassSummary) {
        let instructions = match self
            .store
            .find_instructions_for_state(InstructionState::Executing)
            .await
        {
            Ok(instructions) => instructions,
            Err(e) => {
                error!(error = %e, "Failed to find executing instructions");
                return;
            }
        };

        for instruction in instructions {
            let since = instruction
                .status()
                .map(InstructionStatus::status_date)
                .unwrap_or_else(|| instruction.instruction_date());
            if !self.is_expired(since) {
                continue;
            }
            match self
                .cas(
                    &instruction,
                    InstructionState::Executing,
                    &self.expired_status(&instruction),
                )
                .await
            {
                Ok(true) => {
                    summary.expired += 1;
                    warn!(
                        instruction_id = instruction.id(),
                        instructor_id = %instruction.instructor_id(),
                        topic = %instruction.topic(),
                        "Declined expired executing instruction"
                    );
                }
                Ok(false) => summary.races_lost += 1,
                Err(e) => {
                    error!(
                        instruction_id = instruction.id(),
                        error = %e,
                        "Failed to decline expired instruction"
                    );
                }
            }
        }
    }

    async fn cas(
        &self,
        instruction: &Instruction,
        expected: InstructionState,
        status: &InstructionStatus,
    ) -> Result<bool, ReactorError> {
        self.store
            .compare_and_store_instruction_status(
                instruction.id(),
                instruction.instructor_id(),
                expected,
                status,
            )
            .await
    }

    fn is_expired(&self, since: chrono::DateTime<Utc>) -> bool {
        let limit = chrono::Duration::hours(i64::from(self.config.maximum_incomplete_hours));
        since < Utc::now() - limit
    }

    fn expired_status(&self, instruction: &Instruction) -> InstructionStatus {
        instruction.create_status(
            InstructionState::Declined,
            Some(error_result(
                ERROR_CODE_INSTRUCTION_EXPIRED,
                format!(
                    "Instruction did not complete within {} hours",
                    self.config.maximum_incomplete_hours
                ),
            )),
        )
    }
}
