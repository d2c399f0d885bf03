//! # BatchQueue Core
//!
//! Orchestration of background job groups over a queue-backed worker
//! fleet: **parallel batches** of independent jobs and **sequential
//! chains** whose steps share accumulated context, with durable progress
//! accounting, dynamic mid-flight job appending, Saga-style compensation
//! on chain failure, and user-supplied completion/failure callback jobs.
//!
//! ## Architecture
//!
//! - [`models`] - batch and job value types, input normalization, the
//!   flat-map serialization used by the storage adapters
//! - [`storage`] - the durable state contract with PostgreSQL, Redis, and
//!   in-memory backends
//! - [`messaging`] - the queue transport contract, message envelopes, and
//!   an in-memory transport for tests
//! - [`registry`] - job handler trait and the class-name registry workers
//!   instantiate handlers from
//! - [`orchestration`] - the public [`BatchManager`] API, queue routing,
//!   dispatch, and the worker-side parallel/chain processors
//! - [`worker`] - the queue consumer loop
//! - [`config`] - TOML configuration with defaults, threaded explicitly
//!   through manager construction
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batchqueue_core::{
//!     BatchManager, BatchQueueConfig, HandlerRegistry, InMemoryBatchStorage,
//!     InMemoryQueueClient, JobSpec,
//! };
//!
//! # async fn example() -> batchqueue_core::Result<()> {
//! let mut registry = HandlerRegistry::new();
//! // registry.register("send_email", || Box::new(SendEmail::default()));
//!
//! let manager = BatchManager::new(
//!     Arc::new(InMemoryBatchStorage::new()),
//!     Arc::new(InMemoryQueueClient::new()),
//!     registry,
//!     BatchQueueConfig::default(),
//! );
//!
//! let batch_id = manager
//!     .batch(vec![JobSpec::class("send_email"); 3])
//!     .name("welcome-blast")
//!     .dispatch()
//!     .await?;
//! let progress = manager.get_progress(batch_id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery semantics
//!
//! The queue transport is at-least-once; every processor path tolerates
//! redelivery. Counters are recomputed from authoritative row state
//! rather than incremented blindly, and terminal batch transitions are
//! compare-and-set, so a redelivered message can neither double-count nor
//! double-commit a batch.

pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod storage;
pub mod worker;

pub use config::{BatchQueueConfig, ConfigLoader, ProcessorKind, StorageBackendKind};
pub use errors::{BatchQueueError, JobExecutionError, Result};
pub use messaging::{Delivery, InMemoryQueueClient, JobEnvelope, JobResponse, QueueClient};
pub use models::{
    BatchDefinition, BatchJobDefinition, BatchOptions, BatchProgress, BatchStatus, BatchType,
    CallbackSpec, JobPayload, JobSpec, JobStatus, JsonMap,
};
pub use orchestration::{
    BatchBuilder, BatchManager, ChainProcessor, ParallelProcessor, QueueResolver,
};
pub use registry::{HandlerRegistry, JobHandler, JobOutcome};
pub use storage::{
    connect_from_config, BatchFilters, BatchStorage, BatchUpdate, InMemoryBatchStorage,
    RedisBatchStorage, SqlBatchStorage,
};
pub use worker::{QueueProcessor, QueueWorker};
