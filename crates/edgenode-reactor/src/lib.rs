// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgenode Reactor - Instruction Reactor for Edge Device Nodes
//!
//! This crate durably records instructions sent to an edge node, dispatches
//! them to local handlers, tracks their lifecycle and recovers from crashes
//! or stalled handlers without executing an instruction twice.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Instruction source  │  (upstream server, local services)
//! └──────────┬───────────┘
//!            │ store_instruction
//!            ▼
//! ┌──────────────────────┐        ┌──────────────────────────────┐
//! │   ReactorService     │───────►│      InstructionStore        │
//! │  (ingress + Cancel)  │        │  SQLite / PostgreSQL / memory│
//! └──────────────────────┘        └──────────────┬───────────────┘
//!            ▲                                   │ poll + compare-and-set
//!            │ Cancel                            ▼
//! ┌──────────┴───────────┐        ┌──────────────────────────────┐
//! │     HandlerChain     │◄───────│   InstructionExecutionJob    │
//! │ (first status wins)  │        │  (dispatch + expiry reaper)  │
//! └──────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! # Instruction State Machine
//!
//! ```text
//!             ┌──────────┐
//!             │ Received │◄─────────────┐
//!             └────┬─────┘              │ no handler (retry)
//!        claim     │                    │
//!                  ▼                    │
//!             ┌───────────┐─────────────┘
//!             │ Executing │
//!             └────┬──────┘
//!         ┌────────┴────────┐
//!         ▼                 ▼
//!   ┌───────────┐     ┌──────────┐
//!   │ Completed │     │ Declined │◄── cancel / expiry (from Received or Executing)
//!   └───────────┘     └──────────┘
//! ```
//!
//! `Completed` and `Declined` are terminal. Every competitive transition is a
//! compare-and-set against the stored state, so only one writer wins.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `EDGENODE_DATABASE_URL` | Yes | - | `sqlite:` path or `postgres://` URL |
//! | `EDGENODE_JOB_POLL_INTERVAL_SECS` | No | `10` | Seconds between execution passes |
//! | `EDGENODE_MAX_INCOMPLETE_HOURS` | No | `24` | Hours before incomplete instructions are declined |
//! | `EDGENODE_MAX_RESULT_PARAM_LENGTH` | No | `1024` | Stored result value length limit |
//! | `EDGENODE_CLEANUP_ENABLED` | No | `false` | Delete old handled instructions |
//! | `EDGENODE_CLEANUP_POLL_INTERVAL_SECS` | No | `3600` | Seconds between cleanup runs |
//! | `EDGENODE_CLEANUP_RETENTION_HOURS` | No | `72` | Age of handled instructions to delete |
//!
//! # Modules
//!
//! - [`instruction`]: Instruction, status and state types
//! - [`persistence`]: Instruction store trait and backends
//! - [`dispatch`]: Handler trait and handler chain
//! - [`execution_job`]: Periodic execution and expiry job
//! - [`reactor`]: Ingress service and Cancel instruction
//! - [`batch`]: ExecuteInstructions meta-instruction
//! - [`cleanup_worker`]: Retention of handled instructions
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// ExecuteInstructions handler running nested instructions as a batch.
pub mod batch;

/// Background worker deleting old handled instructions.
pub mod cleanup_worker;

/// Configuration loaded from environment variables.
pub mod config;

/// Instruction handlers and the handler chain dispatcher.
pub mod dispatch;

/// Error types with stable error codes.
pub mod error;

/// Periodic job claiming, dispatching and expiring instructions.
pub mod execution_job;

/// Instruction data model.
pub mod instruction;

/// Embedded database migrations.
pub mod migrations;

/// Instruction store trait and SQLite, PostgreSQL and in-memory backends.
pub mod persistence;

/// Reactor service handling instruction ingress and cancellation.
pub mod reactor;

/// Embeddable runtime for running the reactor inside an application.
pub mod runtime;

pub use dispatch::{HandlerChain, HandlerError, InstructionExecutionService, InstructionHandler};
pub use error::{ReactorError, Result};
pub use instruction::{Instruction, InstructionParameters, InstructionState, InstructionStatus};
pub use persistence::InstructionStore;
pub use reactor::ReactorService;
pub use runtime::ReactorRuntime;
