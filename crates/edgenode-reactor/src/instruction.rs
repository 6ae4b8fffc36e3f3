// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instruction data model.
//!
//! An [`Instruction`] is identified by `(id, instructor_id)`: ids are assigned
//! independently by each issuing authority, so the id alone is not unique.
//! Instructions are immutable values except for their [`InstructionStatus`],
//! which is always replaced wholesale.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReactorError;

/// Instructor ID for instructions originating on the node itself.
///
/// Local instructions never need upstream acknowledgement.
pub const LOCAL_INSTRUCTOR_ID: &str = "LOCAL";

/// Result parameter holding a machine-readable error code.
pub const ERROR_CODE_RESULT_PARAM: &str = "errorCode";

/// Result parameter holding a human-readable message.
pub const MESSAGE_RESULT_PARAM: &str = "message";

/// Error code for instructions declined because they sat incomplete too long.
pub const ERROR_CODE_INSTRUCTION_EXPIRED: &str = "INSTRUCTION_EXPIRED";

/// Well-known instruction topics.
pub mod topics {
    /// Cancel a previously received instruction.
    pub const CANCEL_INSTRUCTION: &str = "CancelInstruction";
    /// Set the value of a local control.
    pub const SET_CONTROL_PARAMETER: &str = "SetControlParameter";
    /// Execute a batch of nested instructions.
    pub const EXECUTE_INSTRUCTIONS: &str = "ExecuteInstructions";
}

/// Well-known instruction parameter names.
pub mod params {
    /// ID of the instruction a Cancel instruction targets.
    pub const ID: &str = "id";
    /// Free-form message.
    pub const MESSAGE: &str = "message";
    /// RFC 3339 date before which the instruction must not execute.
    pub const EXECUTION_DATE: &str = "executionDate";
    /// Instructor ID of a parent instruction.
    pub const PARENT_INSTRUCTOR_ID: &str = "parentInstructorId";
    /// Instruction ID of a parent instruction.
    pub const PARENT_INSTRUCTION_ID: &str = "parentInstructionId";
}

/// Key/value detail attached to a status, e.g. an error code and message.
pub type ResultParameters = BTreeMap<String, String>;

/// Build result parameters carrying an error code and message.
pub fn error_result(error_code: &str, message: impl Into<String>) -> ResultParameters {
    let mut result = ResultParameters::new();
    result.insert(ERROR_CODE_RESULT_PARAM.to_string(), error_code.to_string());
    result.insert(MESSAGE_RESULT_PARAM.to_string(), message.into());
    result
}

/// Build result parameters carrying only a message.
pub fn message_result(message: impl Into<String>) -> ResultParameters {
    let mut result = ResultParameters::new();
    result.insert(MESSAGE_RESULT_PARAM.to_string(), message.into());
    result
}

// ============================================================================
// Instruction State
// ============================================================================

/// Lifecycle state of an instruction.
///
/// ```text
///  Received ──► Executing ──► Completed
///      │            │
///      └────────────┴───────► Declined
/// ```
///
/// `Completed` and `Declined` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionState {
    /// Stored, waiting to be claimed by the execution job.
    Received,
    /// Claimed by the execution job and handed to a handler.
    Executing,
    /// Handled successfully.
    Completed,
    /// Refused, cancelled, failed, or expired.
    Declined,
}

impl InstructionState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Declined)
    }

    /// Name used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "Received",
            Self::Executing => "Executing",
            Self::Completed => "Completed",
            Self::Declined => "Declined",
        }
    }
}

impl fmt::Display for InstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstructionState {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Received" => Ok(Self::Received),
            "Executing" => Ok(Self::Executing),
            "Completed" => Ok(Self::Completed),
            "Declined" => Ok(Self::Declined),
            other => Err(ReactorError::invalid(
                "state",
                format!("unknown instruction state '{}'", other),
            )),
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A single named parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionParameter {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: String,
}

/// Ordered multimap of instruction parameters.
///
/// Repeated names are legal (several control IDs, for example) and insertion
/// order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstructionParameters(Vec<InstructionParameter>);

impl InstructionParameters {
    /// Create an empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter value.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(InstructionParameter {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First value for `name`.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn all_values(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.value.as_str())
            .collect()
    }

    /// Distinct parameter names in first-seen order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for p in &self.0 {
            if !names.contains(&p.name.as_str()) {
                names.push(p.name.as_str());
            }
        }
        names
    }

    /// Iterate over all parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &InstructionParameter> {
        self.0.iter()
    }

    /// Number of parameter values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InstructionParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.add(name, value);
        }
        params
    }
}

impl<'a> IntoIterator for &'a InstructionParameters {
    type Item = &'a InstructionParameter;
    type IntoIter = std::slice::Iter<'a, InstructionParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// Status
// ============================================================================

/// Status of an instruction at a point in time.
///
/// Statuses are values: every change produces a new status via
/// [`with_state`](Self::with_state) or
/// [`with_acknowledged_state`](Self::with_acknowledged_state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionStatus {
    instruction_id: i64,
    state: InstructionState,
    status_date: DateTime<Utc>,
    acknowledged_state: Option<InstructionState>,
    result_parameters: Option<ResultParameters>,
}

impl InstructionStatus {
    /// Create a status in `state` dated now.
    pub fn new(instruction_id: i64, state: InstructionState) -> Self {
        Self::from_parts(instruction_id, state, Utc::now(), None, None)
    }

    /// Create a status from all of its parts, as loaded from storage.
    pub fn from_parts(
        instruction_id: i64,
        state: InstructionState,
        status_date: DateTime<Utc>,
        acknowledged_state: Option<InstructionState>,
        result_parameters: Option<ResultParameters>,
    ) -> Self {
        Self {
            instruction_id,
            state,
            status_date,
            acknowledged_state,
            result_parameters,
        }
    }

    /// ID of the instruction this status belongs to.
    pub fn instruction_id(&self) -> i64 {
        self.instruction_id
    }

    /// Current state.
    pub fn state(&self) -> InstructionState {
        self.state
    }

    /// When the state was entered.
    pub fn status_date(&self) -> DateTime<Utc> {
        self.status_date
    }

    /// State last acknowledged by the issuer, if any.
    pub fn acknowledged_state(&self) -> Option<InstructionState> {
        self.acknowledged_state
    }

    /// Result detail, if any.
    pub fn result_parameters(&self) -> Option<&ResultParameters> {
        self.result_parameters.as_ref()
    }

    /// Single result parameter value.
    pub fn result_parameter(&self, key: &str) -> Option<&str> {
        self.result_parameters
            .as_ref()
            .and_then(|r| r.get(key))
            .map(String::as_str)
    }

    /// New status in `state`, dated now, with the acknowledged state reset.
    pub fn with_state(
        &self,
        state: InstructionState,
        result_parameters: Option<ResultParameters>,
    ) -> Self {
        Self::from_parts(self.instruction_id, state, Utc::now(), None, result_parameters)
    }

    /// New status recording that the issuer acknowledged `state`.
    ///
    /// State, date, and result parameters are preserved.
    pub fn with_acknowledged_state(&self, state: InstructionState) -> Self {
        Self {
            acknowledged_state: Some(state),
            ..self.clone()
        }
    }
}

// ============================================================================
// Instruction
// ============================================================================

/// A single command directed at the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    id: i64,
    instructor_id: String,
    topic: String,
    instruction_date: DateTime<Utc>,
    parameters: InstructionParameters,
    status: Option<InstructionStatus>,
}

impl Instruction {
    /// Create an instruction without parameters or status.
    pub fn new(
        id: i64,
        instructor_id: impl Into<String>,
        topic: impl Into<String>,
        instruction_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            instructor_id: instructor_id.into(),
            topic: topic.into(),
            instruction_date,
            parameters: InstructionParameters::new(),
            status: None,
        }
    }

    /// Create a node-originated instruction with a random ID, dated now.
    pub fn local(topic: impl Into<String>, parameters: InstructionParameters) -> Self {
        let id = (Uuid::new_v4().as_u64_pair().0 >> 1) as i64;
        Self::new(id, LOCAL_INSTRUCTOR_ID, topic, Utc::now()).with_parameters(parameters)
    }

    /// Create a local instruction setting `control_id` to `value`.
    pub fn local_set_control_parameter(control_id: &str, value: &str) -> Self {
        Self::local(
            topics::SET_CONTROL_PARAMETER,
            [(control_id, value)].into_iter().collect(),
        )
    }

    /// Append a parameter value.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.add(name, value);
        self
    }

    /// Replace all parameters.
    pub fn with_parameters(mut self, parameters: InstructionParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Copy of this instruction carrying `status`.
    pub fn with_status(mut self, status: InstructionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Instruction ID, unique per instructor.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Issuing authority.
    pub fn instructor_id(&self) -> &str {
        &self.instructor_id
    }

    /// Command name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// When the instruction was issued.
    pub fn instruction_date(&self) -> DateTime<Utc> {
        self.instruction_date
    }

    /// Instruction parameters.
    pub fn parameters(&self) -> &InstructionParameters {
        &self.parameters
    }

    /// First value of a parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.first_value(name)
    }

    /// Current status, if known.
    pub fn status(&self) -> Option<&InstructionStatus> {
        self.status.as_ref()
    }

    /// Current state, if a status is known.
    pub fn state(&self) -> Option<InstructionState> {
        self.status.as_ref().map(InstructionStatus::state)
    }

    /// Whether the instruction originated on the node.
    pub fn is_local(&self) -> bool {
        self.instructor_id == LOCAL_INSTRUCTOR_ID
    }

    /// Deferred execution date, if the instruction carries a valid one.
    pub fn execution_date(&self) -> Option<DateTime<Utc>> {
        self.parameter(params::EXECUTION_DATE)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    /// Status to persist for a fresh insert: the carried status, else Received.
    pub fn initial_status(&self) -> InstructionStatus {
        self.status
            .clone()
            .unwrap_or_else(|| InstructionStatus::new(self.id, InstructionState::Received))
    }

    /// New status for this instruction in `state`.
    pub fn create_status(
        &self,
        state: InstructionState,
        result_parameters: Option<ResultParameters>,
    ) -> InstructionStatus {
        InstructionStatus::from_parts(self.id, state, Utc::now(), None, result_parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_state_round_trip_names() {
        for state in [
            InstructionState::Received,
            InstructionState::Executing,
            InstructionState::Completed,
            InstructionState::Declined,
        ] {
            assert_eq!(state.as_str().parse::<InstructionState>().unwrap(), state);
            assert_eq!(state.to_string(), state.as_str());
        }
    }

    #[test]
    fn test_state_parse_unknown() {
        let err = "Queued".parse::<InstructionState>().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INSTRUCTION");
    }

    #[test]
    fn test_state_is_terminal() {
        assert!(!InstructionState::Received.is_terminal());
        assert!(!InstructionState::Executing.is_terminal());
        assert!(InstructionState::Completed.is_terminal());
        assert!(InstructionState::Declined.is_terminal());
    }

    #[test]
    fn test_parameters_preserve_order_and_duplicates() {
        let mut params = InstructionParameters::new();
        params.add("controlId", "/power/1");
        params.add("value", "1");
        params.add("controlId", "/power/2");

        assert_eq!(params.len(), 3);
        assert_eq!(params.first_value("controlId"), Some("/power/1"));
        assert_eq!(params.all_values("controlId"), vec!["/power/1", "/power/2"]);
        assert_eq!(params.names(), vec!["controlId", "value"]);
        assert_eq!(params.first_value("missing"), None);
    }

    #[test]
    fn test_with_state_resets_acknowledgement() {
        let status = InstructionStatus::new(1, InstructionState::Received)
            .with_acknowledged_state(InstructionState::Received);
        assert_eq!(status.acknowledged_state(), Some(InstructionState::Received));

        let next = status.with_state(
            InstructionState::Declined,
            Some(message_result("nope")),
        );
        assert_eq!(next.state(), InstructionState::Declined);
        assert_eq!(next.acknowledged_state(), None);
        assert_eq!(next.result_parameter(MESSAGE_RESULT_PARAM), Some("nope"));
        assert!(next.status_date() >= status.status_date());
    }

    #[test]
    fn test_with_acknowledged_state_preserves_result_parameters() {
        let done = InstructionStatus::new(7, InstructionState::Received).with_state(
            InstructionState::Completed,
            Some(error_result("E1", "detail")),
        );
        let acked = done.with_acknowledged_state(InstructionState::Completed);

        assert_eq!(acked.state(), InstructionState::Completed);
        assert_eq!(acked.acknowledged_state(), Some(InstructionState::Completed));
        assert_eq!(acked.result_parameters(), done.result_parameters());
        assert_eq!(acked.status_date(), done.status_date());
    }

    #[test]
    fn test_local_instruction() {
        let instr = Instruction::local_set_control_parameter("/power/1", "on");
        assert!(instr.is_local());
        assert!(instr.id() >= 0);
        assert_eq!(instr.topic(), topics::SET_CONTROL_PARAMETER);
        assert_eq!(instr.parameter("/power/1"), Some("on"));
        assert!(instr.status().is_none());
        assert_eq!(instr.initial_status().state(), InstructionState::Received);
    }

    #[test]
    fn test_execution_date() {
        let at = Utc::now() + Duration::hours(1);
        let instr = Instruction::new(1, "fleet", "Foo", Utc::now())
            .with_parameter(params::EXECUTION_DATE, at.to_rfc3339());
        assert_eq!(instr.execution_date().map(|d| d.timestamp()), Some(at.timestamp()));

        let bad = Instruction::new(2, "fleet", "Foo", Utc::now())
            .with_parameter(params::EXECUTION_DATE, "tomorrow");
        assert_eq!(bad.execution_date(), None);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = InstructionStatus::new(3, InstructionState::Completed);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["instructionId"], 3);
        assert_eq!(json["state"], "Completed");
        assert!(json["acknowledgedState"].is_null());
    }
}
