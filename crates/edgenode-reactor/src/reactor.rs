// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reactor service: instruction ingress and the built-in Cancel instruction.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{HandlerError, InstructionHandler};
use crate::error::ReactorError;
use crate::instruction::{
    Instruction, InstructionState, InstructionStatus, message_result, params, topics,
};
use crate::persistence::InstructionStore;

/// Entry point for instructions arriving at the node.
///
/// Stores new instructions for the execution job to pick up and answers
/// `CancelInstruction` directly against the store.
#[derive(Clone)]
pub struct ReactorService {
    store: Arc<dyn InstructionStore>,
}

impl ReactorService {
    /// Create a new reactor service over `store`.
    pub fn new(store: Arc<dyn InstructionStore>) -> Self {
        Self { store }
    }

    /// The instruction store this service writes to.
    pub fn store(&self) -> &Arc<dyn InstructionStore> {
        &self.store
    }

    /// Persist an incoming instruction.
    ///
    /// Instructions without a status are stored as `Received`. An instruction
    /// carrying a status is a replay: its status overwrites that of an
    /// existing instruction with the same key, or it is stored as given.
    #[instrument(skip(self, instruction), fields(
        instruction_id = instruction.id(),
        instructor_id = %instruction.instructor_id(),
        topic = %instruction.topic(),
    ))]
    pub async fn store_instruction(&self, instruction: &Instruction) -> Result<(), ReactorError> {
        let Some(status) = instruction.status() else {
            self.store.store_instruction(instruction).await?;
            info!("Instruction received");
            return Ok(());
        };

        let existing = self
            .store
            .get_instruction(instruction.id(), instruction.instructor_id())
            .await?;
        if existing.is_none() {
            match self.store.store_instruction(instruction).await {
                Ok(()) => {
                    info!(state = %status.state(), "Instruction stored with supplied status");
                    return Ok(());
                }
                // stored concurrently between lookup and insert; update it instead
                Err(ReactorError::DuplicateInstruction { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.store
            .store_instruction_status(instruction.id(), instruction.instructor_id(), status)
            .await?;
        debug!(state = %status.state(), "Instruction status replaced");
        Ok(())
    }

    /// Process an instruction this service handles directly.
    ///
    /// Returns `None` for topics other than `CancelInstruction`. A Cancel is
    /// always answered with `Completed` or `Declined`.
    #[instrument(skip(self, instruction), fields(
        instruction_id = instruction.id(),
        topic = %instruction.topic(),
    ))]
    pub async fn process_instruction(&self, instruction: &Instruction) -> Option<InstructionStatus> {
        if instruction.topic() != topics::CANCEL_INSTRUCTION {
            return None;
        }
        Some(self.cancel(instruction).await)
    }

    async fn cancel(&self, instruction: &Instruction) -> InstructionStatus {
        let declined =
            |message: String| instruction.create_status(InstructionState::Declined, Some(message_result(message)));

        let Some(raw_id) = instruction.parameter(params::ID) else {
            return declined(format!("Missing {} parameter", params::ID));
        };
        let Ok(target_id) = raw_id.trim().parse::<i64>() else {
            return declined(format!("Invalid {} parameter: {}", params::ID, raw_id));
        };

        let target = match self
            .store
            .get_instruction(target_id, instruction.instructor_id())
            .await
        {
            Ok(Some(target)) => target,
            Ok(None) => return declined(format!("Instruction {} not found", target_id)),
            Err(e) => return declined(format!("Failed to load instruction {}: {}", target_id, e)),
        };

        let observed = target.state().unwrap_or(InstructionState::Received);
        if observed.is_terminal() {
            return declined(format!("Instruction {} is already {}", target_id, observed));
        }

        let reason = instruction
            .parameter(params::MESSAGE)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Cancelled by instruction {}", instruction.id()));
        let cancelled = target.create_status(
            InstructionState::Declined,
            Some(message_result(reason.clone())),
        );

        match self
            .store
            .compare_and_store_instruction_status(
                target.id(),
                target.instructor_id(),
                observed,
                &cancelled,
            )
            .await
        {
            Ok(true) => {
                info!(target_id, previous_state = %observed, "Instruction cancelled");
                self.cancel_children(&target, &reason).await;
                instruction.create_status(InstructionState::Completed, None)
            }
            Ok(false) => {
                debug!(target_id, "Instruction changed state before it could be cancelled");
                declined(format!("Instruction {} changed state and was not cancelled", target_id))
            }
            Err(e) => declined(format!("Failed to cancel instruction {}: {}", target_id, e)),
        }
    }

    async fn cancel_children(&self, parent: &Instruction, reason: &str) {
        let children = match self
            .store
            .find_instructions_for_state_and_parent(
                InstructionState::Received,
                parent.instructor_id(),
                parent.id(),
            )
            .await
        {
            Ok(children) => children,
            Err(e) => {
                warn!(parent_id = parent.id(), error = %e, "Failed to find child instructions");
                return;
            }
        };

        for child in children {
            let status =
                child.create_status(InstructionState::Declined, Some(message_result(reason)));
            match self
                .store
                .compare_and_store_instruction_status(
                    child.id(),
                    child.instructor_id(),
                    InstructionState::Received,
                    &status,
                )
                .await
            {
                Ok(true) => info!(parent_id = parent.id(), child_id = child.id(), "Child instruction cancelled"),
                Ok(false) => debug!(child_id = child.id(), "Child instruction already picked up"),
                Err(e) => warn!(child_id = child.id(), error = %e, "Failed to cancel child instruction"),
            }
        }
    }
}

#[async_trait]
impl InstructionHandler for ReactorService {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == topics::CANCEL_INSTRUCTION
    }

    async fn process_instruction(
        &self,
        instruction: &Instruction,
    ) -> Result<Option<InstructionStatus>, HandlerError> {
        Ok(ReactorService::process_instruction(self, instruction).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryInstructionStore;
    use chrono::Utc;

    fn service() -> (Arc<MemoryInstructionStore>, ReactorService) {
        let store = Arc::new(MemoryInstructionStore::new());
        (store.clone(), ReactorService::new(store))
    }

    fn cancel(id: &str) -> Instruction {
        Instruction::new(100, "server", topics::CANCEL_INSTRUCTION, Utc::now())
            .with_parameter(params::ID, id)
    }

    async fn state_of(store: &MemoryInstructionStore, id: i64) -> InstructionState {
        store
            .get_instruction(id, "server")
            .await
            .unwrap()
            .and_then(|i| i.state())
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_new_instruction() {
        let (store, service) = service();
        let instruction = Instruction::new(1, "server", "Foo", Utc::now()).with_parameter("a", "b");
        service.store_instruction(&instruction).await.unwrap();

        assert_eq!(state_of(&store, 1).await, InstructionState::Received);
        let err = service.store_instruction(&instruction).await.unwrap_err();
        assert!(matches!(err, ReactorError::DuplicateInstruction { .. }));
    }

    #[tokio::test]
    async fn test_store_replayed_status() {
        let (store, service) = service();
        let instruction = Instruction::new(1, "server", "Foo", Utc::now());
        service.store_instruction(&instruction).await.unwrap();

        let replay = instruction.clone().with_status(
            instruction
                .create_status(InstructionState::Completed, None)
                .with_acknowledged_state(InstructionState::Completed),
        );
        service.store_instruction(&replay).await.unwrap();
        assert_eq!(state_of(&store, 1).await, InstructionState::Completed);

        // unknown key with a status is stored verbatim
        let fresh = Instruction::new(2, "server", "Foo", Utc::now());
        let fresh = fresh
            .clone()
            .with_status(fresh.create_status(InstructionState::Declined, None));
        service.store_instruction(&fresh).await.unwrap();
        assert_eq!(state_of(&store, 2).await, InstructionState::Declined);
    }

    #[tokio::test]
    async fn test_other_topics_ignored() {
        let (_, service) = service();
        let other = Instruction::new(1, "server", "Foo", Utc::now());
        assert!(service.process_instruction(&other).await.is_none());
        assert!(!service.handles_topic("Foo"));
        assert!(service.handles_topic(topics::CANCEL_INSTRUCTION));
    }

    #[tokio::test]
    async fn test_cancel_received_instruction() {
        let (store, service) = service();
        service
            .store_instruction(&Instruction::new(1, "server", "Foo", Utc::now()))
            .await
            .unwrap();

        let status = service.process_instruction(&cancel("1")).await.unwrap();

        assert_eq!(status.state(), InstructionState::Completed);
        assert_eq!(status.instruction_id(), 100);
        assert_eq!(state_of(&store, 1).await, InstructionState::Declined);
    }

    #[tokio::test]
    async fn test_cancel_executing_instruction() {
        let (store, service) = service();
        let target = Instruction::new(1, "server", "Foo", Utc::now());
        service
            .store_instruction(
                &target
                    .clone()
                    .with_status(target.create_status(InstructionState::Executing, None)),
            )
            .await
            .unwrap();

        let status = service.process_instruction(&cancel("1")).await.unwrap();
        assert_eq!(status.state(), InstructionState::Completed);
        assert_eq!(state_of(&store, 1).await, InstructionState::Declined);
    }

    #[tokio::test]
    async fn test_cancel_missing_or_invalid_target() {
        let (_, service) = service();

        let status = service.process_instruction(&cancel("5")).await.unwrap();
        assert_eq!(status.state(), InstructionState::Declined);
        assert!(status.result_parameter("message").is_some());

        let status = service.process_instruction(&cancel("abc")).await.unwrap();
        assert_eq!(status.state(), InstructionState::Declined);

        let no_id = Instruction::new(100, "server", topics::CANCEL_INSTRUCTION, Utc::now());
        let status = service.process_instruction(&no_id).await.unwrap();
        assert_eq!(status.state(), InstructionState::Declined);
    }

    #[tokio::test]
    async fn test_cancel_only_same_instructor() {
        let (store, service) = service();
        let target = Instruction::new(1, "other", "Foo", Utc::now());
        store.store_instruction(&target).await.unwrap();

        let status = service.process_instruction(&cancel("1")).await.unwrap();
        assert_eq!(status.state(), InstructionState::Declined);
        let target = store.get_instruction(1, "other").await.unwrap().unwrap();
        assert_eq!(target.state(), Some(InstructionState::Received));
    }

    #[tokio::test]
    async fn test_cancel_completed_instruction_declined() {
        let (store, service) = service();
        let target = Instruction::new(1, "server", "Foo", Utc::now());
        service.store_instruction(&target).await.unwrap();
        let completed = target.create_status(InstructionState::Completed, None);
        store
            .store_instruction_status(1, "server", &completed)
            .await
            .unwrap();

        let status = service.process_instruction(&cancel("1")).await.unwrap();

        assert_eq!(status.state(), InstructionState::Declined);
        assert_eq!(state_of(&store, 1).await, InstructionState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_declines_received_children() {
        let (store, service) = service();
        service
            .store_instruction(&Instruction::new(1, "server", "Foo", Utc::now()))
            .await
            .unwrap();
        for id in [2, 3] {
            let child = Instruction::new(id, "server", "Foo", Utc::now())
                .with_parameter(params::PARENT_INSTRUCTOR_ID, "server")
                .with_parameter(params::PARENT_INSTRUCTION_ID, "1");
            service.store_instruction(&child).await.unwrap();
        }
        let executing = store.get_instruction(3, "server").await.unwrap().unwrap();
        store
            .store_instruction_status(
                3,
                "server",
                &executing.create_status(InstructionState::Executing, None),
            )
            .await
            .unwrap();

        let request = cancel("1").with_parameter(params::MESSAGE, "operator stop");
        let status = service.process_instruction(&request).await.unwrap();

        assert_eq!(status.state(), InstructionState::Completed);
        let child = store.get_instruction(2, "server").await.unwrap().unwrap();
        assert_eq!(child.state(), Some(InstructionState::Declined));
        assert_eq!(
            child.status().unwrap().result_parameter("message"),
            Some("operator stop")
        );
        // only Received children are cancelled
        assert_eq!(state_of(&store, 3).await, InstructionState::Executing);
    }

    /// Store whose instructions complete right after they are read.
    struct CompletingStore {
        inner: MemoryInstructionStore,
    }

    #[async_trait]
    impl InstructionStore for CompletingStore {
        async fn store_instruction(&self, instruction: &Instruction) -> Result<(), ReactorError> {
            self.inner.store_instruction(instruction).await
        }

        async fn get_instruction(
            &self,
            instruction_id: i64,
            instructor_id: &str,
        ) -> Result<Option<Instruction>, ReactorError> {
            let found = self.inner.get_instruction(instruction_id, instructor_id).await?;
            if let Some(instruction) = &found {
                let done = instruction.create_status(InstructionState::Completed, None);
                self.inner
                    .store_instruction_status(instruction_id, instructor_id, &done)
                    .await?;
            }
            Ok(found)
        }

        async fn find_instructions_for_state(
            &self,
            state: InstructionState,
        ) -> Result<Vec<Instruction>, ReactorError> {
            self.inner.find_instructions_for_state(state).await
        }

        async fn find_instructions_for_state_and_parent(
            &self,
            state: InstructionState,
            parent_instructor_id: &str,
            parent_instruction_id: i64,
        ) -> Result<Vec<Instruction>, ReactorError> {
            self.inner
                .find_instructions_for_state_and_parent(
                    state,
                    parent_instructor_id,
                    parent_instruction_id,
                )
                .await
        }

        async fn find_instructions_for_acknowledgement(
            &self,
        ) -> Result<Vec<Instruction>, ReactorError> {
            self.inner.find_instructions_for_acknowledgement().await
        }

        async fn store_instruction_status(
            &self,
            instruction_id: i64,
            instructor_id: &str,
            status: &InstructionStatus,
        ) -> Result<(), ReactorError> {
            self.inner
                .store_instruction_status(instruction_id, instructor_id, status)
                .await
        }

        async fn compare_and_store_instruction_status(
            &self,
            instruction_id: i64,
            instructor_id: &str,
            expected_state: InstructionState,
            status: &InstructionStatus,
        ) -> Result<bool, ReactorError> {
            self.inner
                .compare_and_store_instruction_status(
                    instruction_id,
                    instructor_id,
                    expected_state,
                    status,
                )
                .await
        }

        async fn delete_handled_instructions_older_than(
            &self,
            hours: u32,
        ) -> Result<u64, ReactorError> {
            self.inner.delete_handled_instructions_older_than(hours).await
        }
    }

    #[tokio::test]
    async fn test_cancel_target_completed_concurrently_declined() {
        let store = Arc::new(CompletingStore {
            inner: MemoryInstructionStore::new(),
        });
        let service = ReactorService::new(store.clone());
        service
            .store_instruction(&Instruction::new(1, "server", "Foo", Utc::now()))
            .await
            .unwrap();

        let status = service.process_instruction(&cancel("1")).await.unwrap();

        assert_eq!(status.state(), InstructionState::Declined);
        assert!(
            status
                .result_parameter("message")
                .unwrap()
                .contains("changed state")
        );
        let target = store.inner.get_instruction(1, "server").await.unwrap().unwrap();
        assert_eq!(target.state(), Some(InstructionState::Completed));
        assert!(target.status().unwrap().result_parameters().is_none());
    }
}
