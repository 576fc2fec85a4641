//! Retry/backoff decisions.
//!
//! Everything here is pure: the caller supplies `now`, and jitter is derived
//! from a hash of the job id and attempt number, so the same inputs always
//! produce the same schedule.

use chrono::{DateTime, Utc};
use jobq_core::{BackoffKind, BackoffPolicy, JobStatus};
use sha2::{Digest, Sha256};

use crate::types::Job;

/// Outcome of [`RetryController::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The job was moved to `delayed` and becomes claimable at `retry_at`.
    Retry { attempts_made: u32, delay_ms: u64, retry_at: DateTime<Utc> },
    /// No attempts left; the dead-letter store takes it from here.
    Exhausted { attempts_made: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    max_delay_ms: u64,
}

impl RetryController {
    pub fn new(max_delay_ms: u64) -> Self {
        Self { max_delay_ms }
    }

    /// Record one failed execution of `job` and decide what happens next.
    ///
    /// `attempts_made` counts failed executions and is incremented here. If
    /// it is still below `max_attempts` the job is set to `delayed` with the
    /// backoff for that attempt. Otherwise the job is left for the
    /// dead-letter store; its status is not touched.
    pub fn decide(&self, job: &mut Job, now: DateTime<Utc>) -> RetryDecision {
        job.attempts_made = (job.attempts_made + 1).min(job.max_attempts.max(1));
        if job.attempts_made >= job.max_attempts {
            return RetryDecision::Exhausted { attempts_made: job.attempts_made };
        }

        let delay_ms = self.delay_for(&job.backoff, job.attempts_made, &job.id);
        let retry_at = now + chrono::Duration::milliseconds(delay_ms as i64);
        job.status = JobStatus::Delayed;
        job.delay_until = Some(retry_at);
        RetryDecision::Retry { attempts_made: job.attempts_made, delay_ms, retry_at }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, policy: &BackoffPolicy, attempt: u32, job_id: &str) -> u64 {
        let base = match policy.kind {
            BackoffKind::Fixed => policy.delay_ms,
            BackoffKind::Exponential => exponential_delay_ms(policy.delay_ms, attempt),
        }
        .min(self.max_delay_ms);

        if policy.jitter <= 0.0 {
            return base;
        }
        let spread = (base as f64 * policy.jitter.min(1.0) * jitter_fraction(job_id, attempt)) as u64;
        base - spread.min(base)
    }
}

/// `base * 2^(attempt-1)`, saturating at `u64::MAX`.
fn exponential_delay_ms(base: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1);
    if shift >= 64 {
        return if base == 0 { 0 } else { u64::MAX };
    }
    base.checked_mul(1u64 << shift).unwrap_or(u64::MAX)
}

/// Stable value in `[0, 1)` derived from `sha256("<id>:<attempt>")`.
fn jitter_fraction(job_id: &str, attempt: u32) -> f64 {
    let digest = Sha256::digest(format!("{job_id}:{attempt}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}
