use serde::{Deserialize, Serialize};

/// Shape of the delay curve between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// The same delay before every retry.
    Fixed,
    /// `delay * 2^(attempt-1)`, capped by the dispatcher's maximum.
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay_ms: u64,
    /// Fraction of the computed delay (0.0..=1.0) that jitter may shave off.
    /// Zero disables jitter.
    #[serde(default)]
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Fixed, delay_ms, jitter: 0.0 }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self { kind: BackoffKind::Exponential, delay_ms, jitter: 0.0 }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(2000)
    }
}

/// Max dequeues allowed within a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub duration_ms: u64,
}

/// Fully resolved per-queue job defaults. Every job submitted to the queue
/// starts from these and overlays its own [`JobOptions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Per-job execution timeout; `None` falls back to the dispatcher-wide
    /// `max_execution_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: 0,
            attempts: default_attempts(),
            backoff: BackoffPolicy::default(),
            timeout_ms: None,
        }
    }
}

impl JobDefaults {
    /// Overlay `opts` on top of these defaults. Fields left `None` in
    /// `opts` keep the default value.
    pub fn overlay(&self, opts: &JobOptions) -> JobDefaults {
        JobDefaults {
            priority: opts.priority.unwrap_or(self.priority),
            attempts: opts.attempts.unwrap_or(self.attempts),
            backoff: opts.backoff.clone().unwrap_or_else(|| self.backoff.clone()),
            timeout_ms: opts.timeout_ms.or(self.timeout_ms),
        }
    }
}

fn default_attempts() -> u32 {
    3
}

/// Caller-supplied overrides at enqueue time. Everything is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub priority: Option<i32>,
    /// Hold the job in `delayed` for this many milliseconds before it
    /// becomes claimable.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }
}

/// A named priority lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Lower rank = more important lane. Informational; lanes never
    /// borrow each other's capacity.
    pub priority_rank: u32,
    /// Max simultaneously active jobs.
    pub concurrency: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub defaults: JobDefaults,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, priority_rank: u32, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            priority_rank,
            concurrency,
            rate_limit: None,
            defaults: JobDefaults::default(),
        }
    }

    pub fn with_rate_limit(mut self, max: u32, duration_ms: u64) -> Self {
        self.rate_limit = Some(RateLimit { max, duration_ms });
        self
    }

    pub fn with_defaults(mut self, defaults: JobDefaults) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Claimable now.
    Waiting,
    /// Claimable once `delay_until` has passed.
    Delayed,
    /// Held by exactly one dispatcher slot.
    Active,
    Completed,
    /// Terminal failure; a dead-letter record exists.
    Failed,
    /// Lease expired while active; claimable again.
    Stalled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Waiting,
        JobStatus::Delayed,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Stalled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stalled => "stalled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Cancellation is only possible before a dispatcher claims the job.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "delayed" => Ok(JobStatus::Delayed),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stalled" => Ok(JobStatus::Stalled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_keeps_defaults_for_missing_fields() {
        let defaults = JobDefaults {
            priority: 3,
            attempts: 5,
            backoff: BackoffPolicy::exponential(1000),
            timeout_ms: Some(60_000),
        };
        let merged = defaults.overlay(&JobOptions::default().with_priority(1));
        assert_eq!(merged.priority, 1);
        assert_eq!(merged.attempts, 5);
        assert_eq!(merged.backoff, BackoffPolicy::exponential(1000));
        assert_eq!(merged.timeout_ms, Some(60_000));
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("removed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn backoff_serialises_with_type_tag() {
        let json = serde_json::to_value(BackoffPolicy::fixed(500)).unwrap();
        assert_eq!(json["type"], "fixed");
        assert_eq!(json["delay_ms"], 500);
    }
}
