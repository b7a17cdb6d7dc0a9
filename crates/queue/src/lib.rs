//! Durable task queue and shared state for herald.
//!
//! This crate provides delayed work and cross-process state on top of Redis:
//!
//! - **Tasks**: tagged payloads with `not_before`, dedupe keys and recurrence
//! - **Backends**: Redis for production, in-memory for tests
//! - **Workers**: per-queue concurrency ceilings with graceful drain
//! - **Retry**: exponential or fixed backoff with dead letters
//! - **State**: counters, bounded lists and pub/sub for progress tracking
//! - **Pacing**: minimum interval between external calls

pub mod backend;
pub mod error;
pub mod jobs;
pub mod pubsub;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod workers;

pub use backend::{MemoryBackend, RedisBackend, TaskBackend};
pub use error::{QueueError, TaskError};
pub use jobs::{TaskPayload, dedupe, queues};
pub use pubsub::{EventBus, channels as pubsub_channels};
pub use queue::TaskQueue;
pub use rate_limit::Pacer;
pub use retry::RetryConfig;
pub use scheduler::{RecurringJob, register_recurring};
pub use state::{MemoryStateStore, RedisStateStore, StateStore};
pub use task::{DeadLetter, DedupePolicy, EnqueueOptions, PushOutcome, Repeat, Task};
pub use workers::{TaskContext, TaskHandler, WorkerHandle, WorkerPool};
