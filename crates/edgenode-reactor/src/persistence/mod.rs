// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for edgenode-reactor.
//!
//! [`InstructionStore`] is the only shared mutable state of the reactor.
//! Every competitive state change goes through
//! [`compare_and_store_instruction_status`](InstructionStore::compare_and_store_instruction_status),
//! which each backend implements as a single atomic conditional update.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::MemoryInstructionStore;
pub use self::postgres::PostgresInstructionStore;
pub use self::sqlite::SqliteInstructionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ReactorError;
use crate::instruction::{
    Instruction, InstructionParameters, InstructionState, InstructionStatus, ResultParameters,
};

/// Default maximum length of a stored result parameter value.
pub const DEFAULT_MAX_RESULT_PARAM_LENGTH: usize = 1024;

/// Instruction store used by the reactor service and execution job.
#[async_trait]
pub trait InstructionStore: Send + Sync {
    /// Persist a new instruction with its parameters and initial status.
    ///
    /// The initial status is the instruction's own status when present,
    /// otherwise `Received`. Fails with
    /// [`ReactorError::DuplicateInstruction`] if the key already exists.
    async fn store_instruction(&self, instruction: &Instruction) -> Result<(), ReactorError>;

    /// Get an instruction and its current status.
    async fn get_instruction(
        &self,
        instruction_id: i64,
        instructor_id: &str,
    ) -> Result<Option<Instruction>, ReactorError>;

    /// Get all instructions in `state`, from any instructor.
    ///
    /// Instructions deferred to a future execution date are omitted.
    /// No ordering is guaranteed.
    async fn find_instructions_for_state(
        &self,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, ReactorError>;

    /// Get instructions in `state` that name the given instruction as their parent.
    async fn find_instructions_for_state_and_parent(
        &self,
        state: InstructionState,
        parent_instructor_id: &str,
        parent_instruction_id: i64,
    ) -> Result<Vec<Instruction>, ReactorError>;

    /// Get non-local instructions whose acknowledged state differs from their state.
    async fn find_instructions_for_acknowledgement(&self)
    -> Result<Vec<Instruction>, ReactorError>;

    /// Overwrite an instruction's status unconditionally.
    ///
    /// Only safe where there is a single writer, e.g. acknowledgement bookkeeping.
    async fn store_instruction_status(
        &self,
        instruction_id: i64,
        instructor_id: &str,
        status: &InstructionStatus,
    ) -> Result<(), ReactorError>;

    /// Replace an instruction's status only if its stored state is `expected_state`.
    ///
    /// Returns true if the update was applied. A terminal `expected_state`
    /// never matches, so completed and declined instructions cannot change.
    async fn compare_and_store_instruction_status(
        &self,
        instruction_id: i64,
        instructor_id: &str,
        expected_state: InstructionState,
        status: &InstructionStatus,
    ) -> Result<bool, ReactorError>;

    /// Delete handled instructions issued more than `hours` ago.
    ///
    /// An instruction is handled when it is in a terminal state and either
    /// acknowledged in that state or local. Returns the number deleted.
    async fn delete_handled_instructions_older_than(&self, hours: u32)
    -> Result<u64, ReactorError>;

    /// Verify the backing store is reachable.
    async fn health_check(&self) -> Result<bool, ReactorError> {
        Ok(true)
    }
}

// ============================================================================
// Row mapping shared by the SQL backends
// ============================================================================

/// One row of the instruction/parameter join.
///
/// An instruction with N parameters spans N rows (one row with null
/// parameter columns when it has none).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstructionRow {
    /// Instruction ID.
    pub instruction_id: i64,
    /// Issuing instructor.
    pub instructor_id: String,
    /// Command name.
    pub topic: String,
    /// When the instruction was issued.
    pub instruction_date: DateTime<Utc>,
    /// Current state name.
    pub state: String,
    /// When the current state was entered.
    pub status_date: DateTime<Utc>,
    /// Acknowledged state name.
    pub ack_state: Option<String>,
    /// Result parameters as a JSON object.
    pub result_params: Option<String>,
    /// Parameter name.
    pub pname: Option<String>,
    /// Parameter value.
    pub pvalue: Option<String>,
}

impl InstructionRow {
    fn same_instruction(&self, other: &InstructionRow) -> bool {
        self.instruction_id == other.instruction_id && self.instructor_id == other.instructor_id
    }

    fn into_instruction(self, parameters: InstructionParameters) -> Result<Instruction, ReactorError> {
        let result_parameters = match self.result_params.as_deref() {
            Some(json) => Some(serde_json::from_str::<ResultParameters>(json)?),
            None => None,
        };
        let acknowledged_state = self.ack_state.as_deref().map(str::parse).transpose()?;
        let status = InstructionStatus::from_parts(
            self.instruction_id,
            self.state.parse()?,
            self.status_date,
            acknowledged_state,
            result_parameters,
        );
        Ok(Instruction::new(
            self.instruction_id,
            self.instructor_id,
            self.topic,
            self.instruction_date,
        )
        .with_parameters(parameters)
        .with_status(status))
    }
}

/// Fold joined rows, ordered by key then parameter position, into instructions.
pub(crate) fn rows_to_instructions(
    rows: Vec<InstructionRow>,
) -> Result<Vec<Instruction>, ReactorError> {
    let mut grouped: Vec<(InstructionRow, InstructionParameters)> = Vec::new();
    for mut row in rows {
        let param = row.pname.take().zip(row.pvalue.take());
        let same = grouped
            .last()
            .is_some_and(|(head, _)| head.same_instruction(&row));
        if !same {
            grouped.push((row, InstructionParameters::new()));
        }
        if let (Some((name, value)), Some((_, params))) = (param, grouped.last_mut()) {
            params.add(name, value);
        }
    }
    grouped
        .into_iter()
        .map(|(head, params)| head.into_instruction(params))
        .collect()
}

/// Encode result parameters for storage, truncating long values.
///
/// Returns `None` when there is nothing to store.
pub(crate) fn encode_result_parameters(
    status: &InstructionStatus,
    max_length: usize,
) -> Result<Option<String>, ReactorError> {
    match status.result_parameters() {
        Some(params) if !params.is_empty() => {
            let truncated: ResultParameters = params
                .iter()
                .map(|(k, v)| (k.clone(), truncate_middle(v, max_length)))
                .collect();
            Ok(Some(serde_json::to_string(&truncated)?))
        }
        _ => Ok(None),
    }
}

/// Apply the storage truncation rules to a status held in memory.
pub(crate) fn truncate_result_parameters(
    status: &InstructionStatus,
    max_length: usize,
) -> InstructionStatus {
    let result_parameters = status
        .result_parameters()
        .filter(|params| !params.is_empty())
        .map(|params| {
            params
                .iter()
                .map(|(k, v)| (k.clone(), truncate_middle(v, max_length)))
                .collect()
        });
    InstructionStatus::from_parts(
        status.instruction_id(),
        status.state(),
        status.status_date(),
        status.acknowledged_state(),
        result_parameters,
    )
}

/// Shorten `value` to `max_length` characters by cutting out its middle.
fn truncate_middle(value: &str, max_length: usize) -> String {
    let len = value.chars().count();
    if len <= max_length {
        return value.to_string();
    }
    let half = max_length / 2;
    let head: String = value.chars().take(half).collect();
    let tail: String = value.chars().skip(len - half).collect();
    format!("{}\u{2026}{}", head, tail)
}

/// Cutoff for instructions issued more than `hours` ago.
pub(crate) fn hours_ago(hours: u32) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(i64::from(hours))
}
