// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instruction handler dispatch.
//!
//! Handlers are asked in registration order. The first handler that returns
//! a status wins; handlers that return nothing, fail or panic are skipped.
//! When no handler produces a status the instruction stays unhandled and the
//! execution job decides what to do with it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::ReactorError;
use crate::instruction::{Instruction, InstructionStatus};

/// Errors a handler may raise while processing an instruction.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A required parameter was missing or malformed.
    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// What was wrong with it.
        message: String,
    },

    /// The handler could not carry out the instruction.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The instruction store failed.
    #[error(transparent)]
    Store(#[from] ReactorError),
}

impl HandlerError {
    /// Build an [`InvalidParameter`](Self::InvalidParameter) error.
    pub fn invalid_parameter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A local capability that can act on instructions of certain topics.
#[async_trait]
pub trait InstructionHandler: Send + Sync {
    /// Whether this handler is capable of handling `topic`.
    fn handles_topic(&self, topic: &str) -> bool;

    /// Process an instruction.
    ///
    /// Return `Ok(None)` to decline handling so the next handler is asked.
    async fn process_instruction(
        &self,
        instruction: &Instruction,
    ) -> Result<Option<InstructionStatus>, HandlerError>;
}

/// Something that can execute an instruction, producing its final status.
///
/// This is the seam the execution job and batch handler depend on.
#[async_trait]
pub trait InstructionExecutionService: Send + Sync {
    /// Execute an instruction. `Ok(None)` means no handler produced a status.
    async fn execute_instruction(
        &self,
        instruction: &Instruction,
    ) -> Result<Option<InstructionStatus>, HandlerError>;
}

/// Ordered chain of instruction handlers.
///
/// Handlers may be registered while the chain is in use; a registration
/// takes effect from the next dispatch.
#[derive(Default)]
pub struct HandlerChain {
    handlers: RwLock<Vec<Arc<dyn InstructionHandler>>>,
}

impl HandlerChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain with an initial list of handlers.
    pub fn with_handlers(handlers: Vec<Arc<dyn InstructionHandler>>) -> Self {
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Append a handler to the end of the chain.
    pub fn register(&self, handler: Arc<dyn InstructionHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn InstructionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl InstructionExecutionService for HandlerChain {
    async fn execute_instruction(
        &self,
        instruction: &Instruction,
    ) -> Result<Option<InstructionStatus>, HandlerError> {
        for handler in self.snapshot() {
            if !handler.handles_topic(instruction.topic()) {
                continue;
            }
            let outcome = AssertUnwindSafe(handler.process_instruction(instruction))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Some(status))) => return Ok(Some(status)),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(
                        instruction_id = instruction.id(),
                        instructor_id = %instruction.instructor_id(),
                        topic = %instruction.topic(),
                        error = %e,
                        "Instruction handler failed"
                    );
                }
                Err(_) => {
                    error!(
                        instruction_id = instruction.id(),
                        instructor_id = %instruction.instructor_id(),
                        topic = %instruction.topic(),
                        "Instruction handler panicked"
                    );
                }
            }
        }

        debug!(
            instruction_id = instruction.id(),
            topic = %instruction.topic(),
            "No handler available for instruction"
        );
        Ok(None)
    }
}
