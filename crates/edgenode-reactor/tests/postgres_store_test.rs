// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL instruction store tests.
//!
//! Require `TEST_DATABASE_URL`; skipped otherwise.

mod common;

use chrono::Utc;
use uuid::Uuid;

use edgenode_reactor::error::ReactorError;
use edgenode_reactor::instruction::{Instruction, InstructionState, LOCAL_INSTRUCTOR_ID, params};
use edgenode_reactor::persistence::{InstructionStore, PostgresInstructionStore};

async fn store() -> Option<PostgresInstructionStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    PostgresInstructionStore::connect(&url).await.ok()
}

/// Unique instructor per test so runs do not collide on a shared database.
fn instructor() -> String {
    format!("test-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_store_get_and_cas() {
    skip_if_no_db!();
    let Some(store) = store().await else {
        eprintln!("Skipping test: failed to connect to database");
        return;
    };
    let instructor = instructor();

    let instruction = Instruction::new(1, &instructor, "SetControlParameter", Utc::now())
        .with_parameter("switch/1", "true")
        .with_parameter("switch/1", "false");
    store.store_instruction(&instruction).await.unwrap();
    let err = store.store_instruction(&instruction).await.unwrap_err();
    assert!(matches!(err, ReactorError::DuplicateInstruction { .. }));

    let found = store.get_instruction(1, &instructor).await.unwrap().unwrap();
    assert_eq!(found.state(), Some(InstructionState::Received));
    assert_eq!(found.parameters().all_values("switch/1"), vec!["true", "false"]);

    let executing = instruction.create_status(InstructionState::Executing, None);
    assert!(
        !store
            .compare_and_store_instruction_status(1, &instructor, InstructionState::Executing, &executing)
            .await
            .unwrap()
    );
    assert!(
        store
            .compare_and_store_instruction_status(1, &instructor, InstructionState::Received, &executing)
            .await
            .unwrap()
    );

    let completed = instruction.create_status(InstructionState::Completed, None);
    assert!(
        store
            .compare_and_store_instruction_status(1, &instructor, InstructionState::Executing, &completed)
            .await
            .unwrap()
    );
    assert!(
        !store
            .compare_and_store_instruction_status(1, &instructor, InstructionState::Completed, &executing)
            .await
            .unwrap()
    );
    let found = store.get_instruction(1, &instructor).await.unwrap().unwrap();
    assert_eq!(found.state(), Some(InstructionState::Completed));
}

#[tokio::test]
async fn test_queries() {
    skip_if_no_db!();
    let Some(store) = store().await else {
        eprintln!("Skipping test: failed to connect to database");
        return;
    };
    let instructor = instructor();

    store
        .store_instruction(&Instruction::new(1, &instructor, "Foo", Utc::now()))
        .await
        .unwrap();
    let child = Instruction::new(2, &instructor, "Foo", Utc::now())
        .with_parameter(params::PARENT_INSTRUCTOR_ID, instructor.as_str())
        .with_parameter(params::PARENT_INSTRUCTION_ID, "1")
        .with_parameter(
            params::EXECUTION_DATE,
            (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        );
    store.store_instruction(&child).await.unwrap();

    let received: Vec<i64> = store
        .find_instructions_for_state(InstructionState::Received)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.instructor_id() == instructor)
        .map(|i| i.id())
        .collect();
    assert_eq!(received, vec![1]);

    let children = store
        .find_instructions_for_state_and_parent(InstructionState::Received, &instructor, 1)
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id(), 2);

    let pending = store
        .find_instructions_for_acknowledgement()
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.instructor_id() == instructor)
        .count();
    assert_eq!(pending, 2);
}

#[tokio::test]
async fn test_delete_handled() {
    skip_if_no_db!();
    let Some(store) = store().await else {
        eprintln!("Skipping test: failed to connect to database");
        return;
    };
    let instructor = instructor();
    let old = Utc::now() - chrono::Duration::hours(48);

    let acked = Instruction::new(1, &instructor, "Foo", old).with_parameter("a", "1");
    store.store_instruction(&acked).await.unwrap();
    let status = acked
        .create_status(InstructionState::Completed, None)
        .with_acknowledged_state(InstructionState::Completed);
    store
        .store_instruction_status(1, &instructor, &status)
        .await
        .unwrap();

    let local_id = (Uuid::new_v4().as_u64_pair().0 >> 1) as i64;
    let local = Instruction::new(local_id, LOCAL_INSTRUCTOR_ID, "Foo", old);
    store.store_instruction(&local).await.unwrap();
    store
        .store_instruction_status(
            local_id,
            LOCAL_INSTRUCTOR_ID,
            &local.create_status(InstructionState::Declined, None),
        )
        .await
        .unwrap();

    let deleted = store.delete_handled_instructions_older_than(24).await.unwrap();
    assert!(deleted >= 2);
    assert!(store.get_instruction(1, &instructor).await.unwrap().is_none());
    assert!(
        store
            .get_instruction(local_id, LOCAL_INSTRUCTOR_ID)
            .await
            .unwrap()
            .is_none()
    );
}
