use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminant of [`JobEvent`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    BulkCreated,
    Active,
    Progress,
    Completed,
    Failed,
    Stalled,
    DeadLettered,
    Retried,
    Cancelled,
    QueuePaused,
    QueueResumed,
    QueueError,
    Scheduled,
    MetricsSnapshot,
}

/// Every observable transition in the job system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum JobEvent {
    Created {
        queue: String,
        job_id: String,
        job_name: String,
        priority: i32,
        /// True when the job entered `delayed` rather than `waiting`.
        delayed: bool,
    },
    BulkCreated {
        queue: String,
        count: usize,
        first_job_id: Option<String>,
        last_job_id: Option<String>,
    },
    Active {
        queue: String,
        job_id: String,
        job_name: String,
        attempts_made: u32,
    },
    Progress {
        queue: String,
        job_id: String,
        progress: u8,
    },
    Completed {
        queue: String,
        job_id: String,
        job_name: String,
        /// Wall-clock time from claim to completion.
        duration_ms: u64,
        attempts_made: u32,
    },
    /// A single execution failed. `will_retry` tells whether the job went
    /// back to `delayed` or on to the dead-letter store.
    Failed {
        queue: String,
        job_id: String,
        job_name: String,
        error: String,
        attempts_made: u32,
        will_retry: bool,
        duration_ms: u64,
    },
    Stalled {
        queue: String,
        job_id: String,
        job_name: String,
        stall_count: u32,
    },
    DeadLettered {
        queue: String,
        job_id: String,
        record_id: String,
        error: String,
    },
    Retried {
        queue: String,
        job_id: String,
        attempts_made: u32,
    },
    Cancelled {
        queue: String,
        job_id: String,
    },
    QueuePaused {
        queue: String,
    },
    QueueResumed {
        queue: String,
    },
    QueueError {
        queue: String,
        error: String,
    },
    Scheduled {
        schedule_id: String,
        queue: String,
        job_name: String,
        cron: String,
    },
    MetricsSnapshot(QueueMetricsSnapshot),
}

impl JobEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            JobEvent::Created { .. } => EventKind::Created,
            JobEvent::BulkCreated { .. } => EventKind::BulkCreated,
            JobEvent::Active { .. } => EventKind::Active,
            JobEvent::Progress { .. } => EventKind::Progress,
            JobEvent::Completed { .. } => EventKind::Completed,
            JobEvent::Failed { .. } => EventKind::Failed,
            JobEvent::Stalled { .. } => EventKind::Stalled,
            JobEvent::DeadLettered { .. } => EventKind::DeadLettered,
            JobEvent::Retried { .. } => EventKind::Retried,
            JobEvent::Cancelled { .. } => EventKind::Cancelled,
            JobEvent::QueuePaused { .. } => EventKind::QueuePaused,
            JobEvent::QueueResumed { .. } => EventKind::QueueResumed,
            JobEvent::QueueError { .. } => EventKind::QueueError,
            JobEvent::Scheduled { .. } => EventKind::Scheduled,
            JobEvent::MetricsSnapshot(_) => EventKind::MetricsSnapshot,
        }
    }

    /// The queue this event concerns.
    pub fn queue(&self) -> &str {
        match self {
            JobEvent::Created { queue, .. }
            | JobEvent::BulkCreated { queue, .. }
            | JobEvent::Active { queue, .. }
            | JobEvent::Progress { queue, .. }
            | JobEvent::Completed { queue, .. }
            | JobEvent::Failed { queue, .. }
            | JobEvent::Stalled { queue, .. }
            | JobEvent::DeadLettered { queue, .. }
            | JobEvent::Retried { queue, .. }
            | JobEvent::Cancelled { queue, .. }
            | JobEvent::QueuePaused { queue }
            | JobEvent::QueueResumed { queue }
            | JobEvent::QueueError { queue, .. }
            | JobEvent::Scheduled { queue, .. } => queue,
            JobEvent::MetricsSnapshot(s) => &s.queue,
        }
    }

    /// Channel-style name, e.g. `job:completed`, for logs and listeners.
    pub fn name(&self) -> &'static str {
        match self.kind() {
            EventKind::Created => "job:created",
            EventKind::BulkCreated => "bulk:created",
            EventKind::Active => "job:active",
            EventKind::Progress => "job:progress",
            EventKind::Completed => "job:completed",
            EventKind::Failed => "job:failed",
            EventKind::Stalled => "job:stalled",
            EventKind::DeadLettered => "job:dead_letter",
            EventKind::Retried => "job:retried",
            EventKind::Cancelled => "job:cancelled",
            EventKind::QueuePaused => "queue:paused",
            EventKind::QueueResumed => "queue:resumed",
            EventKind::QueueError => "queue:error",
            EventKind::Scheduled => "job:scheduled",
            EventKind::MetricsSnapshot => "metrics:snapshot",
        }
    }
}

/// A published event plus its position in the global emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Strictly increasing per bus; consumers may use it to drop
    /// redelivered events.
    pub seq: u64,
    pub emitted_at: DateTime<Utc>,
    pub event: JobEvent,
}

/// Immutable counter set for one queue over one metrics window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub queue: String,
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Number of claims (transitions into `active`) in the window.
    pub active: u64,
    pub stalled: u64,
    pub total_processing_ms: u64,
    pub avg_processing_ms: f64,
    /// completed / processed, 0.0 when nothing was processed.
    pub success_rate: f64,
    /// Processed jobs per minute over the window.
    pub throughput_per_min: f64,
    pub window_start: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
}
