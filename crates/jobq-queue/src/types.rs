use std::time::Duration;

use chrono::{DateTime, Utc};
use jobq_core::{BackoffPolicy, JobOptions, JobStatus};
use serde::{Deserialize, Serialize};

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique within its queue; `job_<unix ms>_<12 hex>` unless caller-chosen.
    pub id: String,
    /// Owning queue. Never changes for the job's lifetime.
    pub queue: String,
    /// Processor key.
    pub name: String,
    /// Opaque to the scheduler; handed to the processor untouched.
    pub payload: serde_json::Value,
    /// Lower value = claimed earlier.
    pub priority: i32,
    pub status: JobStatus,
    /// Failed executions so far. Never exceeds `max_attempts`.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout_ms: Option<u64>,
    pub delay_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Advisory, 0-100.
    pub progress: u8,
    pub failed_reason: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Times the job's lease expired while it was active.
    pub stall_count: u32,
    /// Identifies the current claim; a write carrying a stale token is ignored.
    #[serde(skip)]
    pub(crate) lease_token: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
}

impl Job {
    pub fn handle(&self) -> JobHandle {
        JobHandle { id: self.id.clone(), queue: self.queue.clone(), status: self.status }
    }

    /// Time spent since the claim, used for processing-time metrics.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.processed_at
            .map(|at| (now - at).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// What `enqueue` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    pub status: JobStatus,
}

/// One item of a bulk submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub name: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
}

impl BulkJob {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { name: name.into(), payload, options: JobOptions::default() }
    }
}

/// Per-queue job counts for the operational surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub stalled: u64,
    pub paused: bool,
    pub total: u64,
}

/// Result of asking the registry for the next job.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Job),
    /// Nothing eligible now. `next_due` is the earliest delayed job, if any.
    Empty { next_due: Option<DateTime<Utc>> },
    Paused,
    /// `concurrency` jobs are already active.
    AtCapacity,
    RateLimited { retry_after: Duration },
}

/// Immutable snapshot of a job whose retries were exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub queue: String,
    pub job_id: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Filter for listing dead letters. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub queue: Option<String>,
    pub job_name: Option<String>,
}

/// Offset/limit pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: 20 }
    }
}
