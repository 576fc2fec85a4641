use chrono::{DateTime, Utc};
use jobq_core::JobOptions;
use serde::{Deserialize, Serialize};

/// A recurring submission: every time `cron` matches (in `timezone`), a job
/// named `job_name` with the materialized `payload` goes into `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobDefinition {
    /// `schedule_<unix ms>_<12 hex>`.
    pub id: String,
    /// Unique, human-chosen key.
    pub name: String,
    pub cron: String,
    /// IANA name, e.g. `UTC` or `Europe/Berlin`.
    pub timezone: String,
    pub queue: String,
    pub job_name: String,
    /// JSON template; see [`crate::schedule::materialize`].
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
    /// Next trigger. `None` once the expression can never match again.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Input for registering a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub queue: String,
    pub job_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        cron: impl Into<String>,
        queue: impl Into<String>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            timezone: default_timezone(),
            queue: queue.into(),
            job_name: job_name.into(),
            payload: serde_json::Value::Null,
            options: JobOptions::default(),
        }
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

impl From<&jobq_core::config::ScheduleEntry> for NewSchedule {
    fn from(e: &jobq_core::config::ScheduleEntry) -> Self {
        NewSchedule::new(&e.name, &e.cron, &e.queue, &e.job)
            .with_timezone(&e.timezone)
            .with_payload(e.payload.clone())
    }
}
