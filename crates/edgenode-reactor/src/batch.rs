// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `ExecuteInstructions` meta-instruction.
//!
//! Carries a JSON array of nested instructions in its `instructions`
//! parameter:
//!
//! ```json
//! [
//!   {"topic": "SetControlParameter", "params": {"/foo/bar": "1"}},
//!   {"topic": "SetControlParameter", "params": {"/bim/bam": "2"}}
//! ]
//! ```
//!
//! Each nested instruction is executed, in order, as a local instruction
//! through the execution service. With `successMode` `Every` (the default)
//! the batch completes only if every nested instruction completed; with
//! `Some` one completion is enough.

use std::fmt;
use std::str::FromStr;
use std::sync::Weak;

use async_trait::async_trait;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatch::{HandlerError, InstructionExecutionService, InstructionHandler};
use crate::error::ReactorError;
use crate::instruction::{
    Instruction, InstructionParameters, InstructionState, InstructionStatus, ResultParameters,
    message_result, topics,
};

/// Parameter holding the JSON array of nested instructions.
pub const PARAM_INSTRUCTIONS: &str = "instructions";

/// Parameter selecting the [`SuccessMode`].
pub const PARAM_SUCCESS_MODE: &str = "successMode";

/// Result parameter holding the JSON array of nested statuses.
pub const RESULT_PARAM_STATUSES: &str = "statuses";

/// How nested results decide the batch result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SuccessMode {
    /// Every nested instruction must complete.
    #[default]
    Every,
    /// At least one nested instruction must complete.
    Some,
}

impl FromStr for SuccessMode {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            v if v.eq_ignore_ascii_case("every") => Ok(Self::Every),
            v if v.eq_ignore_ascii_case("some") => Ok(Self::Some),
            other => Err(ReactorError::invalid(
                PARAM_SUCCESS_MODE,
                format!("unknown success mode '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NestedInstruction {
    topic: String,
    #[serde(default)]
    params: NestedParams,
}

/// Nested parameters in document order.
///
/// Scalar values are stringified; nested arrays and objects are kept as JSON
/// text; `null` values are dropped.
#[derive(Debug, Default)]
struct NestedParams(InstructionParameters);

impl<'de> Deserialize<'de> for NestedParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParamsVisitor;

        impl<'de> Visitor<'de> for ParamsVisitor {
            type Value = NestedParams;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of parameter names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut params = InstructionParameters::new();
                while let Some((name, value)) = map.next_entry::<String, Value>()? {
                    match value {
                        Value::Null => {}
                        Value::String(s) => params.add(name, s),
                        other => params.add(name, other.to_string()),
                    }
                }
                Ok(NestedParams(params))
            }
        }

        deserializer.deserialize_map(ParamsVisitor)
    }
}

/// Handler for the `ExecuteInstructions` topic.
///
/// Holds a weak reference to the execution service, which normally owns
/// this handler through its chain.
pub struct ExecuteInstructionsHandler {
    executor: Weak<dyn InstructionExecutionService>,
}

impl ExecuteInstructionsHandler {
    /// Create a handler that executes nested instructions through `executor`.
    pub fn new(executor: Weak<dyn InstructionExecutionService>) -> Self {
        Self { executor }
    }

    fn parse(instruction: &Instruction) -> Result<(Vec<NestedInstruction>, SuccessMode), ReactorError> {
        let raw = instruction
            .parameter(PARAM_INSTRUCTIONS)
            .ok_or_else(|| ReactorError::invalid(PARAM_INSTRUCTIONS, "missing"))?;
        let nested: Vec<NestedInstruction> = serde_json::from_str(raw)?;
        if nested.is_empty() {
            return Err(ReactorError::invalid(PARAM_INSTRUCTIONS, "no instructions given"));
        }
        let mode = instruction
            .parameter(PARAM_SUCCESS_MODE)
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();
        Ok((nested, mode))
    }
}

#[async_trait]
impl InstructionHandler for ExecuteInstructionsHandler {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == topics::EXECUTE_INSTRUCTIONS
    }

    async fn process_instruction(
        &self,
        instruction: &Instruction,
    ) -> Result<Option<InstructionStatus>, HandlerError> {
        let (nested, mode) = match Self::parse(instruction) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(Some(instruction.create_status(
                    InstructionState::Declined,
                    Some(message_result(e.to_string())),
                )));
            }
        };
        let Some(executor) = self.executor.upgrade() else {
            return Err(HandlerError::Failed(
                "instruction execution service not available".to_string(),
            ));
        };

        let mut statuses: Vec<Option<InstructionStatus>> = Vec::with_capacity(nested.len());
        for item in nested {
            let local = Instruction::local(item.topic, item.params.0);
            let status = match executor.execute_instruction(&local).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(topic = %local.topic(), error = %e, "Nested instruction failed");
                    None
                }
            };
            debug!(
                topic = %local.topic(),
                state = ?status.as_ref().map(InstructionStatus::state),
                "Nested instruction executed"
            );
            statuses.push(status);
        }

        let completed = |s: &Option<InstructionStatus>| {
            s.as_ref().map(InstructionStatus::state) == Some(InstructionState::Completed)
        };
        let success = match mode {
            SuccessMode::Every => statuses.iter().all(completed),
            SuccessMode::Some => statuses.iter().any(completed),
        };

        let mut result = ResultParameters::new();
        result.insert(
            RESULT_PARAM_STATUSES.to_string(),
            serde_json::to_string(&statuses).map_err(ReactorError::from)?,
        );
        let state = if success {
            InstructionState::Completed
        } else {
            InstructionState::Declined
        };
        Ok(Some(instruction.create_status(state, Some(result))))
    }
}
