// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory instruction store.
//!
//! Useful for tests and for nodes that do not need instructions to survive
//! a restart. The compare-and-set is an equality check under a single lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{DEFAULT_MAX_RESULT_PARAM_LENGTH, InstructionStore, hours_ago, truncate_result_parameters};
use crate::error::ReactorError;
use crate::instruction::{Instruction, InstructionState, InstructionStatus, params};

type Key = (i64, String);

/// Instruction store backed by a `HashMap`.
pub struct MemoryInstructionStore {
    instructions: Mutex<HashMap<Key, Instruction>>,
    max_result_param_length: usize,
}

impl MemoryInstructionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            instructions: Mutex::new(HashMap::new()),
            max_result_param_length: DEFAULT_MAX_RESULT_PARAM_LENGTH,
        }
    }

    /// Set the maximum stored length of result parameter values.
    pub fn with_max_result_param_length(mut self, max: usize) -> Self {
        self.max_result_param_length = max;
        self
    }

    /// Number of stored instructions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Instruction>> {
        // a panic while holding the lock cannot leave a map entry half-written
        self.instructions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select<F>(&self, filter: F) -> Vec<Instruction>
    where
        F: Fn(&Instruction) -> bool,
    {
        self.lock()
            .values()
            .filter(|instruction| filter(instruction))
            .cloned()
            .collect()
    }
}

impl Default for MemoryInstructionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstructionStore for MemoryInstructionStore {
    async fn store_instruction(&self, instruction: &Instruction) -> Result<(), ReactorError> {
        let key = (instruction.id(), instruction.instructor_id().to_string());
        let mut map = self.lock();
        if map.contains_key(&key) {
            return Err(ReactorError::DuplicateInstruction {
                instruction_id: key.0,
                instructor_id: key.1,
            });
        }
        let status = truncate_result_parameters(
            &instruction.initial_status(),
            self.max_result_param_length,
        );
        map.insert(key, instruction.clone().with_status(status));
        Ok(())
    }

    async fn get_instruction(
        &self,
        instruction_id: i64,
        instructor_id: &str,
    ) -> Result<Option<Instruction>, ReactorError> {
        Ok(self
            .lock()
            .get(&(instruction_id, instructor_id.to_string()))
            .cloned())
    }

    async fn find_instructions_for_state(
        &self,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, ReactorError> {
        let now = Utc::now();
        Ok(self.select(|i| {
            i.state() == Some(state) && i.execution_date().is_none_or(|date| date <= now)
        }))
    }

    async fn find_instructions_for_state_and_parent(
        &self,
        state: InstructionState,
        parent_instructor_id: &str,
        parent_instruction_id: i64,
    ) -> Result<Vec<Instruction>, ReactorError> {
        let parent_id = parent_instruction_id.to_string();
        Ok(self.select(|i| {
            i.state() == Some(state)
                && i.parameter(params::PARENT_INSTRUCTOR_ID) == Some(parent_instructor_id)
                && i.parameter(params::PARENT_INSTRUCTION_ID) == Some(parent_id.as_str())
        }))
    }

    async fn find_instructions_for_acknowledgement(
        &self,
    ) -> Result<Vec<Instruction>, ReactorError> {
        Ok(self.select(|i| match i.status() {
            Some(status) => !i.is_local() && status.acknowledged_state() != Some(status.state()),
            None => false,
        }))
    }

    async fn store_instruction_status(
        &self,
        instruction_id: i64,
        instructor_id: &str,
        status: &InstructionStatus,
    ) -> Result<(), ReactorError> {
        let key = (instruction_id, instructor_id.to_string());
        let mut map = self.lock();
        let Some(existing) = map.remove(&key) else {
            return Err(ReactorError::InstructionNotFound {
                instruction_id,
                instructor_id: key.1,
            });
        };
        let status = truncate_result_parameters(status, self.max_result_param_length);
        map.insert(key, existing.with_status(status));
        Ok(())
    }

    async fn compare_and_store_instruction_status(
        &self,
        instruction_id: i64,
        instructor_id: &str,
        expected_state: InstructionState,
        status: &InstructionStatus,
    ) -> Result<bool, ReactorError> {
        if expected_state.is_terminal() {
            return Ok(false);
        }
        let key = (instruction_id, instructor_id.to_string());
        let mut map = self.lock();
        match map.get(&key) {
            Some(existing) if existing.state() == Some(expected_state) => {}
            _ => return Ok(false),
        }
        let status = truncate_result_parameters(status, self.max_result_param_length);
        if let Some(existing) = map.remove(&key) {
            map.insert(key, existing.with_status(status));
        }
        Ok(true)
    }

    async fn delete_handled_instructions_older_than(
        &self,
        hours: u32,
    ) -> Result<u64, ReactorError> {
        let cutoff = hours_ago(hours);
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, i| {
            let handled = match i.status() {
                Some(status) => {
                    status.state().is_terminal()
                        && (i.is_local() || status.acknowledged_state() == Some(status.state()))
                }
                None => false,
            };
            !(handled && i.instruction_date() < cutoff)
        });
        Ok((before - map.len()) as u64)
    }
}
