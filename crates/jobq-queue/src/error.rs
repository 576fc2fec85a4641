use jobq_core::JobStatus;
use thiserror::Error;

/// Errors surfaced by the queue registry, dispatcher and dead-letter store.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Queue already exists: {queue}")]
    DuplicateQueue { queue: String },

    #[error("Job not found: {queue}/{id}")]
    JobNotFound { queue: String, id: String },

    /// No handler registered under the job's name. A deployment defect, so
    /// the job is dead-lettered without consuming a retry.
    #[error("No processor registered for job name: {name}")]
    ProcessorNotFound { name: String },

    /// Normal exhaustion path; reported, never thrown at callers.
    #[error("Job {id} exhausted all {attempts} attempts")]
    MaxAttemptsExceeded { id: String, attempts: u32 },

    #[error("Job {id} did not report completion in time ({reason})")]
    StallTimeout { id: String, reason: String },

    /// Dequeue deferred; not a failure.
    #[error("Queue {queue} rate limited, next slot in {retry_after_ms}ms")]
    RateLimited { queue: String, retry_after_ms: u64 },

    /// Rejected before anything was persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job {id} is {status}, expected {expected}")]
    InvalidState { id: String, status: JobStatus, expected: &'static str },

    #[error("Dead-letter record not found: {id}")]
    DeadLetterNotFound { id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Stable taxonomy code for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::QueueNotFound { .. } => "QUEUE_NOT_FOUND",
            QueueError::DuplicateQueue { .. } => "DUPLICATE_QUEUE",
            QueueError::JobNotFound { .. } => "JOB_NOT_FOUND",
            QueueError::ProcessorNotFound { .. } => "PROCESSOR_NOT_FOUND",
            QueueError::MaxAttemptsExceeded { .. } => "MAX_ATTEMPTS_EXCEEDED",
            QueueError::StallTimeout { .. } => "STALL_TIMEOUT",
            QueueError::RateLimited { .. } => "RATE_LIMITED",
            QueueError::Validation(_) => "VALIDATION_ERROR",
            QueueError::InvalidState { .. } => "INVALID_STATE",
            QueueError::DeadLetterNotFound { .. } => "DEAD_LETTER_NOT_FOUND",
            QueueError::Database(_) => "DATABASE_ERROR",
            QueueError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Backing-store failures pause claiming instead of failing jobs.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, QueueError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
