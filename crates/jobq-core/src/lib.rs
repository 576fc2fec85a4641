//! Shared building blocks for the job queue workspace: configuration,
//! the injectable clock, and the option/status types every other crate
//! speaks.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::JobqConfig;
pub use error::{CoreError, Result};
pub use types::{
    BackoffKind, BackoffPolicy, JobDefaults, JobOptions, JobStatus, QueueConfig, RateLimit,
};
