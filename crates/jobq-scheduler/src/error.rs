use jobq_queue::QueueError;
use thiserror::Error;

/// Errors that can occur within the cron scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cron expression could not be parsed or never fires.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("Schedule name already registered: {name}")]
    DuplicateSchedule { name: String },

    /// Target queue rejected the definition or a materialized job.
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
