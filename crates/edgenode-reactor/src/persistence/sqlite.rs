// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite instruction store, the default for edge nodes.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;

use super::{
    DEFAULT_MAX_RESULT_PARAM_LENGTH, InstructionRow, InstructionStore, encode_result_parameters,
    hours_ago, rows_to_instructions,
};
use crate::error::ReactorError;
use crate::instruction::{
    Instruction, InstructionState, InstructionStatus, LOCAL_INSTRUCTOR_ID, params,
};
use crate::migrations;

const SELECT_INSTRUCTIONS: &str = r#"
    SELECT i.instruction_id, i.instructor_id, i.topic, i.instruction_date,
           i.state, i.status_date, i.ack_state, i.result_params,
           p.pname, p.pvalue
    FROM instructions i
    LEFT JOIN instruction_params p
        ON p.instruction_id = i.instruction_id AND p.instructor_id = i.instructor_id
"#;

const ORDER_INSTRUCTIONS: &str = " ORDER BY i.instructor_id, i.instruction_id, p.pos";

/// SQLite-backed instruction store.
#[derive(Clone)]
pub struct SqliteInstructionStore {
    pool: SqlitePool,
    max_result_param_length: usize,
}

impl SqliteInstructionStore {
    /// Create a new store over a migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_result_param_length: DEFAULT_MAX_RESULT_PARAM_LENGTH,
        }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories, opens the file (creating it if needed)
    /// and runs the embedded migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteInstructionStore::from_path("var/node/instructions.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ReactorError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        migrations::run_sqlite(&pool).await?;

        debug!(path = %path.display(), "Opened SQLite instruction store");
        Ok(Self::new(pool))
    }

    /// Create and initialize a store from a `sqlite:` connection URL.
    ///
    /// Query options such as `mode` are honoured. Without an explicit `mode`
    /// the database file is created if missing. In-memory databases get a
    /// single-connection pool.
    pub async fn connect(url: &str) -> Result<Self, ReactorError> {
        let mut options = SqliteConnectOptions::from_str(url)?;
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        if !in_memory && !url.contains("mode=") {
            options = options.create_if_missing(true);
        }

        if !in_memory
            && let Some(parent) = options.get_filename().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;
        migrations::run_sqlite(&pool).await?;

        debug!(in_memory, "Connected SQLite instruction store");
        Ok(Self::new(pool))
    }

    /// Set the maximum stored length of result parameter values.
    pub fn with_max_result_param_length(mut self, max: usize) -> Self {
        self.max_result_param_length = max;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl InstructionStore for SqliteInstructionStore {
    async fn store_instruction(&self, instruction: &Instruction) -> Result<(), ReactorError> {
        let status = instruction.initial_status();
        let result_params = encode_result_parameters(&status, self.max_result_param_length)?;
        let execute_at = instruction.execution_date().unwrap_or_else(Utc::now);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO instructions
                (instruction_id, instructor_id, topic, instruction_date, execute_at,
                 state, status_date, ack_state, result_params)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instruction.id())
        .bind(instruction.instructor_id())
        .bind(instruction.topic())
        .bind(instruction.instruction_date())
        .bind(execute_at)
        .bind(status.state().as_str())
        .bind(status.status_date())
        .bind(status.acknowledged_state().map(|s| s.as_str()))
        .bind(result_params)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReactorError::from_insert(e, instruction.id(), instruction.instructor_id()))?;

        for (pos, param) in instruction.parameters().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO instruction_params (instruction_id, instructor_id, pos, pname, pvalue)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(instruction.id())
            .bind(instruction.instructor_id())
            .bind(pos as i64)
            .bind(&param.name)
            .bind(&param.value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_instruction(
        &self,
        instruction_id: i64,
        instructor_id: &str,
    ) -> Result<Option<Instruction>, ReactorError> {
        let sql = format!(
            "{SELECT_INSTRUCTIONS} WHERE i.instruction_id = ? AND i.instructor_id = ?{ORDER_INSTRUCTIONS}"
        );
        let rows = sqlx::query_as::<_, InstructionRow>(&sql)
            .bind(instruction_id)
            .bind(instructor_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows_to_instructions(rows)?.into_iter().next())
    }

    async fn find_instructions_for_state(
        &self,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, ReactorError> {
        let sql = format!(
            "{SELECT_INSTRUCTIONS} WHERE i.state = ? AND i.execute_at <= ?{ORDER_INSTRUCTIONS}"
        );
        let rows = sqlx::query_as::<_, InstructionRow>(&sql)
            .bind(state.as_str())
            .bind(Utc::now())
            .fetch_all(&self.pool)
            .await?;

        rows_to_instructions(rows)
    }

    async fn find_instructions_for_state_and_parent(
        &self,
        state: InstructionState,
        parent_instructor_id: &str,
        parent_instruction_id: i64,
    ) -> Result<Vec<Instruction>, ReactorError> {
        let sql = format!(
            r#"{SELECT_INSTRUCTIONS}
            WHERE i.state = ?
              AND EXISTS (
                SELECT 1 FROM instruction_params a
                WHERE a.instruction_id = i.instruction_id AND a.instructor_id = i.instructor_id
                  AND a.pname = ? AND a.pvalue = ?)
              AND EXISTS (
                SELECT 1 FROM instruction_params b
                WHERE b.instruction_id = i.instruction_id AND b.instructor_id = i.instructor_id
                  AND b.pname = ? AND b.pvalue = ?)
            {ORDER_INSTRUCTIONS}"#
        );
        let rows = sqlx::query_as::<_, InstructionRow>(&sql)
            .bind(state.as_str())
            .bind(params::PARENT_INSTRUCTOR_ID)
            .bind(parent_instructor_id)
            .bind(params::PARENT_INSTRUCTION_ID)
            .bind(parent_instruction_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows_to_instructions(rows)
    }

    async fn find_instructions_for_acknowledgement(
        &self,
    ) -> Result<Vec<Instruction>, ReactorError> {
        let sql = format!(
            r#"{SELECT_INSTRUCTIONS}
            WHERE i.instructor_id <> ?
              AND (i.ack_state IS NULL OR i.ack_state <> i.state)
            {ORDER_INSTRUCTIONS}"#
        );
        let rows = sqlx::query_as::<_, InstructionRow>(&sql)
            .bind(LOCAL_INSTRUCTOR_ID)
            .fetch_all(&self.pool)
            .await?;

        rows_to_instructions(rows)
    }

    async fn store_instruction_status(
        &self,
        instruction_id: i64,
        instructor_id: &str,
        status: &InstructionStatus,
    ) -> Result<(), ReactorError> {
        let result_params = encode_result_parameters(status, self.max_result_param_length)?;
        let result = sqlx::query(
            r#"
            UPDATE instructions
            SET state = ?, status_date = ?, ack_state = ?, result_params = ?
            WHERE instruction_id = ? AND instructor_id = ?
            "#,
        )
        .bind(status.state().as_str())
        .bind(status.status_date())
        .bind(status.acknowledged_state().map(|s| s.as_str()))
        .bind(result_params)
        .bind(instruction_id)
        .bind(instructor_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReactorError::InstructionNotFound {
                instruction_id,
                instructor_id: instructor_id.to_string(),
            });
        }
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
        let result_params = encode_result_parameters(status, self.max_result_param_length)?;
        let result = sqlx::query(
            r#"
            UPDATE instructions
            SET state = ?, status_date = ?, ack_state = ?, result_params = ?
            WHERE instruction_id = ? AND instructor_id = ? AND state = ?
            "#,
        )
        .bind(status.state().as_str())
        .bind(status.status_date())
        .bind(status.acknowledged_state().map(|s| s.as_str()))
        .bind(result_params)
        .bind(instruction_id)
        .bind(instructor_id)
        .bind(expected_state.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_handled_instructions_older_than(
        &self,
        hours: u32,
    ) -> Result<u64, ReactorError> {
        let cutoff = hours_ago(hours);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM instruction_params
            WHERE EXISTS (
                SELECT 1 FROM instructions i
                WHERE i.instruction_id = instruction_params.instruction_id
                  AND i.instructor_id = instruction_params.instructor_id
                  AND i.state IN ('Completed', 'Declined')
                  AND (i.ack_state = i.state OR i.instructor_id = ?)
                  AND i.instruction_date < ?)
            "#,
        )
        .bind(LOCAL_INSTRUCTOR_ID)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM instructions
            WHERE state IN ('Completed', 'Declined')
              AND (ack_state = state OR instructor_id = ?)
              AND instruction_date < ?
            "#,
        )
        .bind(LOCAL_INSTRUCTOR_ID)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<bool, ReactorError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
