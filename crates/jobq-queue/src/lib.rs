//! `jobq-queue` — priority lanes, the job store and the worker dispatcher.
//!
//! ```text
//! enqueue ──► QueueRegistry ──► JobStore (SQLite)
//!                  │ claim_next (pause → rate limit → concurrency → priority, FIFO)
//!                  ▼
//!             Dispatcher ──► Processor
//!                  │ success ─► completed
//!                  │ failure ─► RetryController ─► delayed | DeadLetterStore
//!                  │ timeout / lost lease ─► stalled (re-claimable once)
//!                  ▼
//!              EventBus ──► MetricsAggregator, listeners
//! ```
//!
//! [`JobQueue`] wires these together from a [`jobq_core::JobqConfig`].

pub mod api;
pub mod db;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod processor;
mod rate_limit;
pub mod registry;
pub mod retry;
pub mod store;
pub mod types;

pub use api::JobQueue;
pub use dead_letter::DeadLetterStore;
pub use dispatcher::{Dispatcher, JobOutcome};
pub use error::{QueueError, Result};
pub use processor::{processor_fn, Processor, ProcessorError, ProcessorRegistry, ProgressReporter};
pub use registry::QueueRegistry;
pub use retry::{RetryController, RetryDecision};
pub use store::JobStore;
pub use types::{
    BulkJob, ClaimOutcome, DeadLetterFilter, DeadLetterRecord, Job, JobHandle, Page, QueueStatus,
};
