// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for edgenode-reactor.
//!
//! [`ReactorRuntime`] wires an instruction store, the handler chain, the
//! execution job and the cleanup worker together and runs the background
//! tasks on the current tokio runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edgenode_reactor::persistence::SqliteInstructionStore;
//! use edgenode_reactor::runtime::ReactorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteInstructionStore::from_path("var/node/instructions.db").await?;
//!
//!     let runtime = ReactorRuntime::builder()
//!         .store(Arc::new(store))
//!         .handler(Arc::new(MyControlHandler::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.service().store_instruction(&instruction).await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::batch::ExecuteInstructionsHandler;
use crate::cleanup_worker::{CleanupWorkerConfig, InstructionCleanupWorker};
use crate::dispatch::{HandlerChain, InstructionExecutionService, InstructionHandler};
use crate::execution_job::{ExecutionJobConfig, InstructionExecutionJob};
use crate::persistence::InstructionStore;
use crate::reactor::ReactorService;

/// Builder for creating a [`ReactorRuntime`].
#[derive(Default)]
pub struct ReactorRuntimeBuilder {
    store: Option<Arc<dyn InstructionStore>>,
    handlers: Vec<Arc<dyn InstructionHandler>>,
    job: ExecutionJobConfig,
    cleanup: CleanupWorkerConfig,
}

impl std::fmt::Debug for ReactorRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("handlers", &self.handlers.len())
            .field("job", &self.job)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl ReactorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instruction store (required).
    pub fn store(mut self, store: Arc<dyn InstructionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add an instruction handler.
    ///
    /// Handlers are consulted after the built-in Cancel and
    /// ExecuteInstructions handlers, in the order they are added.
    pub fn handler(mut self, handler: Arc<dyn InstructionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Set the execution job configuration.
    pub fn job_config(mut self, config: ExecutionJobConfig) -> Self {
        self.job = config;
        self
    }

    /// Set the cleanup worker configuration.
    ///
    /// Default: disabled.
    pub fn cleanup_config(mut self, config: CleanupWorkerConfig) -> Self {
        self.cleanup = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ReactorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("instruction store is required"))?;

        Ok(ReactorRuntimeConfig {
            store,
            handlers: self.handlers,
            job: self.job,
            cleanup: self.cleanup,
        })
    }
}

/// Configuration for a [`ReactorRuntime`].
pub struct ReactorRuntimeConfig {
    store: Arc<dyn InstructionStore>,
    handlers: Vec<Arc<dyn InstructionHandler>>,
    job: ExecutionJobConfig,
    cleanup: CleanupWorkerConfig,
}

impl std::fmt::Debug for ReactorRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorRuntimeConfig")
            .field("store", &"...")
            .field("handlers", &self.handlers.len())
            .field("job", &self.job)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl ReactorRuntimeConfig {
    /// Start the runtime, spawning the execution job and cleanup worker.
    pub async fn start(self) -> Result<ReactorRuntime> {
        let service = ReactorService::new(self.store.clone());

        let chain = Arc::new(HandlerChain::new());
        let executor: Arc<dyn InstructionExecutionService> = chain.clone();
        chain.register(Arc::new(service.clone()));
        chain.register(Arc::new(ExecuteInstructionsHandler::new(Arc::downgrade(
            &executor,
        ))));
        for handler in self.handlers {
            chain.register(handler);
        }

        let job = InstructionExecutionJob::new(self.store.clone(), executor, self.job);
        let job_shutdown = job.shutdown_handle();
        let job_handle = tokio::spawn(async move { job.run().await });

        let cleanup = InstructionCleanupWorker::new(self.store.clone(), self.cleanup);
        let cleanup_shutdown = cleanup.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move { cleanup.run().await });

        info!(handlers = chain.len(), "ReactorRuntime started");

        Ok(ReactorRuntime {
            service,
            chain,
            store: self.store,
            job_handle,
            job_shutdown,
            cleanup_handle,
            cleanup_shutdown,
        })
    }
}

/// A running instruction reactor that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ReactorRuntime {
    service: ReactorService,
    chain: Arc<HandlerChain>,
    store: Arc<dyn InstructionStore>,
    job_handle: JoinHandle<()>,
    job_shutdown: Arc<Notify>,
    cleanup_handle: JoinHandle<()>,
    cleanup_shutdown: Arc<Notify>,
}

impl ReactorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ReactorRuntimeBuilder {
        ReactorRuntimeBuilder::new()
    }

    /// The reactor service accepting incoming instructions.
    pub fn service(&self) -> &ReactorService {
        &self.service
    }

    /// The handler chain; handlers registered here join the next pass.
    pub fn handlers(&self) -> &Arc<HandlerChain> {
        &self.chain
    }

    /// The instruction store.
    pub fn store(&self) -> &Arc<dyn InstructionStore> {
        &self.store
    }

    /// Check if the execution job is still running.
    pub fn is_running(&self) -> bool {
        !self.job_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the background tasks and waits for the current pass to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("ReactorRuntime shutting down...");

        self.job_shutdown.notify_one();
        self.cleanup_shutdown.notify_one();

        let job = self.job_handle.await;
        let cleanup = self.cleanup_handle.await;
        for (task, outcome) in [("execution job", job), ("cleanup worker", cleanup)] {
            if let Err(e) = outcome {
                error!(task, error = %e, "ReactorRuntime task panicked");
                return Err(anyhow::anyhow!("{} task panicked: {}", task, e));
            }
        }

        info!("ReactorRuntime shutdown complete");
        Ok(())
    }
}
