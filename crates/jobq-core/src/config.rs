use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::{BackoffPolicy, JobDefaults, JobOptions, QueueConfig, RateLimit};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 512 * 1024; // 512 KB per job payload
pub const DEFAULT_METRICS_RESET_SECS: u64 = 3600; // hourly snapshot-and-reset
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 30_000; // stalled if no heartbeat for 30s
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Top-level config (jobq.toml + JOBQ_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobqConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Defaults applied under every queue's own defaults.
    #[serde(default)]
    pub job_defaults: JobDefaults,
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueEntry>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for JobqConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            job_defaults: JobDefaults::default(),
            queues: default_queues(),
            dispatcher: DispatcherConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// One lane as written in the config file. `defaults` is partial and is
/// overlaid on `job_defaults` by [`JobqConfig::queue_configs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    pub priority_rank: u32,
    pub concurrency: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub defaults: JobOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How long an idle slot sleeps before polling again when nothing woke it.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A claimed job whose lease is not renewed within this window is stalled.
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
    /// Times a stalled job may be re-claimed before it is treated as failed.
    #[serde(default = "default_max_stalled_reclaims")]
    pub max_stalled_reclaims: u32,
    /// Upper bound for any computed retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Pause before claiming again after a backing-store error.
    #[serde(default = "default_store_error_backoff_ms")]
    pub store_error_backoff_ms: u64,
    /// Run-time cap for jobs that carry no `timeout_ms`. Past it the lease
    /// is no longer renewed and the job is stalled.
    #[serde(default = "default_max_execution_ms")]
    pub max_execution_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
            max_stalled_reclaims: default_max_stalled_reclaims(),
            max_backoff_ms: default_max_backoff_ms(),
            store_error_backoff_ms: default_store_error_backoff_ms(),
            max_execution_ms: default_max_execution_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_reset_secs")]
    pub reset_interval_secs: u64,
    /// Number of past snapshots kept in memory per queue.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            reset_interval_secs: default_metrics_reset_secs(),
            history_len: default_history_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Recurring definitions registered at startup if no definition with
    /// the same name exists yet.
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true, schedules: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    /// Five-field (`m h dom mon dow`) or six-field (with seconds) cron.
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub queue: String,
    pub job: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_payload_bytes: default_max_payload_bytes() }
    }
}

/// The five lanes of the original deployment, most urgent first.
fn default_queues() -> Vec<QueueEntry> {
    let lane = |name: &str, rank: u32, concurrency: usize, rate: Option<u32>, defaults| QueueEntry {
        name: name.to_string(),
        priority_rank: rank,
        concurrency,
        rate_limit: rate.map(|max| RateLimit { max, duration_ms: 60_000 }),
        defaults,
    };
    vec![
        lane(
            "critical",
            1,
            10,
            None,
            JobOptions::default()
                .with_priority(1)
                .with_attempts(5)
                .with_backoff(BackoffPolicy::exponential(1000)),
        ),
        lane("high", 2, 20, Some(1000), JobOptions::default().with_priority(2).with_attempts(4)),
        lane("normal", 3, 50, Some(5000), JobOptions::default().with_priority(3).with_attempts(3)),
        lane("low", 4, 100, Some(10_000), JobOptions::default().with_priority(4).with_attempts(2)),
        lane(
            "bulk",
            5,
            200,
            Some(50_000),
            JobOptions::default()
                .with_priority(5)
                .with_attempts(3)
                .with_timeout_ms(3_600_000),
        ),
    ]
}

fn bool_true() -> bool {
    true
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobq/jobq.db", home)
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_lease_timeout_ms() -> u64 {
    DEFAULT_LEASE_TIMEOUT_MS
}
fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn default_stall_check_interval_ms() -> u64 {
    5_000
}
fn default_max_stalled_reclaims() -> u32 {
    1
}
fn default_max_backoff_ms() -> u64 {
    3_600_000
}
fn default_store_error_backoff_ms() -> u64 {
    5_000
}
fn default_max_execution_ms() -> u64 {
    3_600_000
}
fn default_metrics_reset_secs() -> u64 {
    DEFAULT_METRICS_RESET_SECS
}
fn default_history_len() -> usize {
    24
}
fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

impl JobqConfig {
    /// Load config from a TOML file with JOBQ_* env var overrides.
    ///
    /// Nested keys use a double underscore: `JOBQ_DATABASE__PATH=/tmp/q.db`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobqConfig = Figment::from(Serialized::defaults(JobqConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBQ_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the dispatcher cannot honour.
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for q in &self.queues {
            if !seen.insert(q.name.as_str()) {
                return Err(crate::error::CoreError::InvalidValue {
                    field: "queues".to_string(),
                    reason: format!("duplicate queue name {}", q.name),
                });
            }
            if q.concurrency == 0 {
                return Err(crate::error::CoreError::InvalidValue {
                    field: format!("queues.{}.concurrency", q.name),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.dispatcher.heartbeat_interval_ms >= self.dispatcher.lease_timeout_ms {
            return Err(crate::error::CoreError::InvalidValue {
                field: "dispatcher.heartbeat_interval_ms".to_string(),
                reason: "must be shorter than lease_timeout_ms".to_string(),
            });
        }
        if self.dispatcher.max_execution_ms == 0 {
            return Err(crate::error::CoreError::InvalidValue {
                field: "dispatcher.max_execution_ms".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve every configured lane against the global job defaults.
    pub fn queue_configs(&self) -> Vec<QueueConfig> {
        self.queues
            .iter()
            .map(|entry| {
                let queue = QueueConfig::new(entry.name.clone(), entry.priority_rank, entry.concurrency)
                    .with_defaults(self.job_defaults.overlay(&entry.defaults));
                match entry.rate_limit {
                    Some(RateLimit { max, duration_ms }) => queue.with_rate_limit(max, duration_ms),
                    None => queue,
                }
            })
            .collect()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobq/jobq.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackoffKind;

    #[test]
    fn default_lanes_match_original_deployment() {
        let cfg = JobqConfig::default();
        let queues = cfg.queue_configs();
        let names: Vec<_> = queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, ["critical", "high", "normal", "low", "bulk"]);

        let critical = &queues[0];
        assert_eq!(critical.concurrency, 10);
        assert!(critical.rate_limit.is_none());
        assert_eq!(critical.defaults.attempts, 5);
        assert_eq!(critical.defaults.backoff.delay_ms, 1000);

        // high inherits the global exponential 2s backoff
        let high = &queues[1];
        assert_eq!(high.defaults.backoff.kind, BackoffKind::Exponential);
        assert_eq!(high.defaults.backoff.delay_ms, 2000);
        assert_eq!(high.rate_limit, Some(RateLimit { max: 1000, duration_ms: 60_000 }));

        assert_eq!(queues[4].defaults.timeout_ms, Some(3_600_000));
    }

    #[test]
    fn duplicate_queue_names_rejected() {
        let mut cfg = JobqConfig::default();
        let first = cfg.queues[0].clone();
        cfg.queues.push(first);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut cfg = JobqConfig::default();
        cfg.queues[2].concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_execution_cap_rejected() {
        let mut cfg = JobqConfig::default();
        assert_eq!(cfg.dispatcher.max_execution_ms, 3_600_000);
        cfg.dispatcher.max_execution_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let toml = r#"
            [dispatcher]
            lease_timeout_ms = 60000

            [[queues]]
            name = "only"
            priority_rank = 1
            concurrency = 2
        "#;
        let cfg: JobqConfig = Figment::from(Serialized::defaults(JobqConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(cfg.dispatcher.lease_timeout_ms, 60_000);
        assert_eq!(cfg.dispatcher.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        assert_eq!(cfg.queues.len(), 1);
        assert_eq!(cfg.queue_configs()[0].defaults.attempts, 3);
    }
}
