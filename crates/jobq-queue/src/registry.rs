use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jobq_core::{Clock, JobOptions, JobStatus, QueueConfig};
use jobq_events::{EventBus, JobEvent};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::rate_limit::SlidingWindow;
use crate::store::{JobStore, StoreClaim};
use crate::types::{BulkJob, ClaimOutcome, Job, JobHandle, Page, QueueStatus};

/// Runtime state of one lane.
struct QueueState {
    config: RwLock<QueueConfig>,
    paused: AtomicBool,
    /// Held across check, claim and record so concurrent claimers cannot
    /// both take the last slot of a window.
    limiter: Mutex<Option<SlidingWindow>>,
    /// Signalled when work may have become claimable (enqueue, resume,
    /// promotion, capacity change).
    wake: Arc<Notify>,
}

/// Named priority lanes and the operations that add jobs to them or take
/// jobs from them.
pub struct QueueRegistry {
    queues: DashMap<String, Arc<QueueState>>,
    store: Arc<JobStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    max_payload_bytes: usize,
}

impl QueueRegistry {
    pub fn new(
        store: Arc<JobStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        max_payload_bytes: usize,
    ) -> Self {
        Self { queues: DashMap::new(), store, bus, clock, max_payload_bytes }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn state(&self, queue: &str) -> Result<Arc<QueueState>> {
        self.queues
            .get(queue)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| QueueError::QueueNotFound { queue: queue.to_string() })
    }

    pub fn create_queue(&self, config: QueueConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(QueueError::Validation("queue name must not be empty".into()));
        }
        if config.concurrency == 0 {
            return Err(QueueError::Validation(format!(
                "queue {}: concurrency must be at least 1",
                config.name
            )));
        }
        if let Some(rl) = config.rate_limit {
            if rl.max == 0 || rl.duration_ms == 0 {
                return Err(QueueError::Validation(format!(
                    "queue {}: rate limit max and duration must be positive",
                    config.name
                )));
            }
        }

        match self.queues.entry(config.name.clone()) {
            Entry::Occupied(_) => Err(QueueError::DuplicateQueue { queue: config.name }),
            Entry::Vacant(slot) => {
                info!(
                    queue = %config.name,
                    rank = config.priority_rank,
                    concurrency = config.concurrency,
                    rate_limit = ?config.rate_limit,
                    "queue created"
                );
                slot.insert(Arc::new(QueueState {
                    limiter: Mutex::new(config.rate_limit.map(SlidingWindow::new)),
                    config: RwLock::new(config),
                    paused: AtomicBool::new(false),
                    wake: Arc::new(Notify::new()),
                }));
                Ok(())
            }
        }
    }

    /// Queue names, most important lane first.
    pub fn queue_names(&self) -> Vec<String> {
        let mut lanes: Vec<(u32, String)> = self
            .queues
            .iter()
            .map(|e| (e.value().config.read().priority_rank, e.key().clone()))
            .collect();
        lanes.sort();
        lanes.into_iter().map(|(_, name)| name).collect()
    }

    pub fn queue_config(&self, queue: &str) -> Result<QueueConfig> {
        Ok(self.state(queue)?.config.read().clone())
    }

    /// Change a lane's concurrency at runtime. Takes effect on the next claim.
    pub fn set_concurrency(&self, queue: &str, concurrency: usize) -> Result<()> {
        if concurrency == 0 {
            return Err(QueueError::Validation("concurrency must be at least 1".into()));
        }
        let state = self.state(queue)?;
        state.config.write().concurrency = concurrency;
        info!(queue, concurrency, "queue concurrency changed");
        state.wake.notify_one();
        Ok(())
    }

    /// Notifier the dispatcher for `queue` parks on while idle.
    pub fn wake_handle(&self, queue: &str) -> Result<Arc<Notify>> {
        Ok(Arc::clone(&self.state(queue)?.wake))
    }

    // -----------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------

    /// Validate, persist and announce one job. Nothing is persisted if
    /// validation fails.
    #[instrument(skip(self, payload, opts))]
    pub fn enqueue(&self, queue: &str, name: &str, payload: Value, opts: JobOptions) -> Result<JobHandle> {
        let state = self.state(queue)?;
        let job = self.build_job(&state, queue, name, payload, &opts)?;
        self.store.insert(&job)?;
        self.announce(&job);
        state.wake.notify_one();
        Ok(job.handle())
    }

    /// Submit many jobs to one queue. Each item succeeds or fails on its
    /// own; one bad item does not reject the rest.
    #[instrument(skip(self, jobs), fields(count = jobs.len()))]
    pub fn enqueue_bulk(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Result<JobHandle>>> {
        let state = self.state(queue)?;
        let mut results = Vec::with_capacity(jobs.len());
        let mut accepted: Vec<String> = Vec::new();

        for item in jobs {
            let res = self
                .build_job(&state, queue, &item.name, item.payload, &item.options)
                .and_then(|job| {
                    self.store.insert(&job)?;
                    Ok(job)
                });
            match res {
                Ok(job) => {
                    self.announce(&job);
                    accepted.push(job.id.clone());
                    results.push(Ok(job.handle()));
                }
                Err(e) => {
                    debug!(error = %e, "bulk item rejected");
                    results.push(Err(e));
                }
            }
        }

        self.bus.publish(JobEvent::BulkCreated {
            queue: queue.to_string(),
            count: accepted.len(),
            first_job_id: accepted.first().cloned(),
            last_job_id: accepted.last().cloned(),
        });
        if !accepted.is_empty() {
            state.wake.notify_one();
        }
        Ok(results)
    }

    fn announce(&self, job: &Job) {
        debug!(job_id = %job.id, priority = job.priority, status = %job.status, "job created");
        self.bus.publish(JobEvent::Created {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            priority: job.priority,
            delayed: job.status == JobStatus::Delayed,
        });
    }

    fn build_job(
        &self,
        state: &QueueState,
        queue: &str,
        name: &str,
        payload: Value,
        opts: &JobOptions,
    ) -> Result<Job> {
        if name.trim().is_empty() {
            return Err(QueueError::Validation("job name must not be empty".into()));
        }
        let size = serde_json::to_vec(&payload)?.len();
        if size > self.max_payload_bytes {
            return Err(QueueError::Validation(format!(
                "payload is {size} bytes, limit is {}",
                self.max_payload_bytes
            )));
        }

        let resolved = state.config.read().defaults.overlay(opts);
        if resolved.attempts == 0 {
            return Err(QueueError::Validation("attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&resolved.backoff.jitter) {
            return Err(QueueError::Validation("backoff jitter must be within 0.0..=1.0".into()));
        }

        let now = self.clock.now();
        let id = match &opts.job_id {
            Some(id) if id.trim().is_empty() => {
                return Err(QueueError::Validation("job id must not be empty".into()));
            }
            Some(id) => id.clone(),
            None => generate_job_id(now),
        };

        let delay_until = opts
            .delay_ms
            .filter(|d| *d > 0)
            .map(|d| now + chrono::Duration::milliseconds(d as i64));

        Ok(Job {
            id,
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            priority: resolved.priority,
            status: if delay_until.is_some() { JobStatus::Delayed } else { JobStatus::Waiting },
            attempts_made: 0,
            max_attempts: resolved.attempts,
            backoff: resolved.backoff,
            timeout_ms: resolved.timeout_ms,
            delay_until,
            created_at: now,
            processed_at: None,
            completed_at: None,
            progress: 0,
            failed_reason: None,
            result: None,
            stall_count: 0,
            lease_token: None,
            lease_until: None,
        })
    }

    // -----------------------------------------------------------------
    // Pause / resume
    // -----------------------------------------------------------------

    /// Stop claims from `queue`. Active jobs run to completion. Idempotent.
    pub fn pause(&self, queue: &str) -> Result<()> {
        let state = self.state(queue)?;
        if !state.paused.swap(true, Ordering::SeqCst) {
            info!(queue, "queue paused");
            self.bus.publish(JobEvent::QueuePaused { queue: queue.to_string() });
        }
        Ok(())
    }

    pub fn resume(&self, queue: &str) -> Result<()> {
        let state = self.state(queue)?;
        if state.paused.swap(false, Ordering::SeqCst) {
            info!(queue, "queue resumed");
            self.bus.publish(JobEvent::QueueResumed { queue: queue.to_string() });
            state.wake.notify_one();
        }
        Ok(())
    }

    pub fn is_paused(&self, queue: &str) -> Result<bool> {
        Ok(self.state(queue)?.paused.load(Ordering::SeqCst))
    }

    // -----------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------

    /// Claim the next eligible job of `queue` for `lease`.
    ///
    /// Honours pause, the rate limit and the concurrency limit, in that
    /// order. Eligible jobs are taken by priority, then creation time.
    pub fn claim_next(&self, queue: &str, lease: Duration) -> Result<ClaimOutcome> {
        let state = self.state(queue)?;
        if state.paused.load(Ordering::SeqCst) {
            return Ok(ClaimOutcome::Paused);
        }

        let mut limiter = state.limiter.lock();
        let now = self.clock.now();
        if let Some(window) = limiter.as_mut() {
            if let Err(retry_after) = window.check(now) {
                let limit = window.limit();
                debug!(
                    queue,
                    max = limit.max,
                    window_ms = limit.duration_ms,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limited"
                );
                return Ok(ClaimOutcome::RateLimited { retry_after });
            }
        }

        let concurrency = state.config.read().concurrency;
        let token = Uuid::new_v4().to_string();
        let lease_until = now + chrono::Duration::milliseconds(lease.as_millis() as i64);

        Ok(match self.store.claim(queue, concurrency, now, lease_until, &token)? {
            StoreClaim::Claimed(job) => {
                if let Some(window) = limiter.as_mut() {
                    window.record(now);
                }
                debug!(queue, job_id = %job.id, "job claimed");
                ClaimOutcome::Claimed(job)
            }
            StoreClaim::Empty { next_due } => ClaimOutcome::Empty { next_due },
            StoreClaim::AtCapacity => ClaimOutcome::AtCapacity,
        })
    }

    // -----------------------------------------------------------------
    // Inspection and maintenance
    // -----------------------------------------------------------------

    pub fn get_job(&self, queue: &str, id: &str) -> Result<Job> {
        self.state(queue)?;
        self.store
            .get(queue, id)?
            .ok_or_else(|| QueueError::JobNotFound { queue: queue.to_string(), id: id.to_string() })
    }

    pub fn list_jobs(&self, queue: &str, status: JobStatus, page: Page) -> Result<Vec<Job>> {
        self.state(queue)?;
        self.store.list(queue, status, page)
    }

    pub fn queue_status(&self, queue: &str) -> Result<QueueStatus> {
        let state = self.state(queue)?;
        let counts = self.store.counts(queue)?;
        let get = |s: JobStatus| counts.get(&s).copied().unwrap_or(0);
        Ok(QueueStatus {
            name: queue.to_string(),
            waiting: get(JobStatus::Waiting),
            active: get(JobStatus::Active),
            completed: get(JobStatus::Completed),
            failed: get(JobStatus::Failed),
            delayed: get(JobStatus::Delayed),
            stalled: get(JobStatus::Stalled),
            paused: state.paused.load(Ordering::SeqCst),
            total: counts.values().sum(),
        })
    }

    /// Status of every lane, most important first.
    pub fn all_queue_status(&self) -> Result<Vec<QueueStatus>> {
        self.queue_names().iter().map(|q| self.queue_status(q)).collect()
    }

    /// Remove a `waiting` or `delayed` job. Active and terminal jobs are
    /// rejected with `InvalidState`.
    pub fn cancel(&self, queue: &str, id: &str) -> Result<()> {
        self.state(queue)?;
        self.store.cancel(queue, id)?;
        info!(queue, job_id = id, "job cancelled");
        self.bus.publish(JobEvent::Cancelled { queue: queue.to_string(), job_id: id.to_string() });
        Ok(())
    }

    /// Move a delayed job to `waiting` so it is claimable now.
    pub fn promote(&self, queue: &str, id: &str) -> Result<()> {
        let state = self.state(queue)?;
        self.store.promote(queue, id)?;
        state.wake.notify_one();
        Ok(())
    }

    /// Give a failed job one more attempt.
    pub fn retry_failed(&self, queue: &str, id: &str) -> Result<Job> {
        let state = self.state(queue)?;
        let job = self.store.retry_failed(queue, id)?;
        state.wake.notify_one();
        Ok(job)
    }

    /// Delete up to `limit` completed or failed jobs that finished more
    /// than `grace` ago.
    pub fn clean(&self, queue: &str, status: JobStatus, grace: Duration, limit: usize) -> Result<usize> {
        self.state(queue)?;
        if !status.is_terminal() {
            return Err(QueueError::Validation(format!(
                "only completed or failed jobs can be cleaned, not {status}"
            )));
        }
        let cutoff = self.clock.now() - chrono::Duration::milliseconds(grace.as_millis() as i64);
        let removed = self.store.clean(queue, status, cutoff, limit)?;
        info!(queue, %status, removed, "jobs cleaned");
        Ok(removed)
    }
}

/// `job_<unix ms>_<12 hex chars>`.
fn generate_job_id(now: chrono::DateTime<chrono::Utc>) -> String {
    let rand = Uuid::new_v4().simple().to_string();
    format!("job_{}_{}", now.timestamp_millis(), &rand[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use chrono::Utc;
    use jobq_core::{JobDefaults, ManualClock};
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn setup() -> (QueueRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(JobStore::new(open_in_memory().unwrap()));
        let bus = Arc::new(EventBus::new(clock.clone()));
        let reg = QueueRegistry::new(store, bus, clock.clone(), 1024);
        (reg, clock)
    }

    fn claimed_id(outcome: ClaimOutcome) -> String {
        match outcome {
            ClaimOutcome::Claimed(job) => job.id,
            other => panic!("expected a claim, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_queue_is_rejected() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();
        let err = reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap_err();
        assert_eq!(err.kind(), "DUPLICATE_QUEUE");
    }

    #[test]
    fn queue_names_follow_rank() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("low", 4, 1)).unwrap();
        reg.create_queue(QueueConfig::new("critical", 1, 1)).unwrap();
        assert_eq!(reg.queue_names(), vec!["critical", "low"]);
    }

    #[test]
    fn enqueue_rejects_unknown_queue_and_bad_input() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();

        let err = reg.enqueue("nope", "x", json!({}), JobOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "QUEUE_NOT_FOUND");

        let err = reg.enqueue("normal", "", json!({}), JobOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");

        let big = json!({ "blob": "x".repeat(2048) });
        let err = reg.enqueue("normal", "x", big, JobOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");

        assert_eq!(reg.queue_status("normal").unwrap().total, 0, "nothing persisted");
    }

    #[test]
    fn generated_ids_have_expected_shape() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();
        let h = reg.enqueue("normal", "x", json!({}), JobOptions::default()).unwrap();
        let parts: Vec<&str> = h.id.split('_').collect();
        assert_eq!(parts[0], "job");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 12);
        assert_eq!(h.status, JobStatus::Waiting);
    }

    #[test]
    fn claims_by_priority_then_fifo() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("critical", 1, 1)).unwrap();
        let opts = |p| JobOptions::default().with_priority(p);
        let j1 = reg.enqueue("critical", "x", json!(1), opts(1)).unwrap();
        let j2 = reg.enqueue("critical", "x", json!(2), opts(1)).unwrap();
        let j3 = reg.enqueue("critical", "x", json!(3), opts(0)).unwrap();

        assert_eq!(claimed_id(reg.claim_next("critical", LEASE).unwrap()), j3.id);
        assert!(matches!(reg.claim_next("critical", LEASE).unwrap(), ClaimOutcome::AtCapacity));
        reg.set_concurrency("critical", 3).unwrap();
        assert_eq!(claimed_id(reg.claim_next("critical", LEASE).unwrap()), j1.id);
        assert_eq!(claimed_id(reg.claim_next("critical", LEASE).unwrap()), j2.id);
    }

    #[test]
    fn paused_queue_is_not_claimed_until_resumed() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("bulk", 5, 10)).unwrap();
        reg.enqueue("bulk", "x", json!({}), JobOptions::default()).unwrap();

        reg.pause("bulk").unwrap();
        assert!(matches!(reg.claim_next("bulk", LEASE).unwrap(), ClaimOutcome::Paused));
        assert_eq!(reg.queue_status("bulk").unwrap().waiting, 1);

        reg.resume("bulk").unwrap();
        assert!(matches!(reg.claim_next("bulk", LEASE).unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn delayed_job_waits_for_its_time() {
        let (reg, clock) = setup();
        reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();
        let h = reg
            .enqueue("normal", "x", json!({}), JobOptions::default().with_delay_ms(5000))
            .unwrap();
        assert_eq!(h.status, JobStatus::Delayed);

        match reg.claim_next("normal", LEASE).unwrap() {
            ClaimOutcome::Empty { next_due } => assert!(next_due.is_some()),
            other => panic!("unexpected {other:?}"),
        }
        clock.advance(chrono::Duration::milliseconds(5000));
        assert_eq!(claimed_id(reg.claim_next("normal", LEASE).unwrap()), h.id);
    }

    #[test]
    fn rate_limit_defers_claims() {
        let (reg, clock) = setup();
        reg.create_queue(QueueConfig::new("high", 2, 10).with_rate_limit(2, 1000)).unwrap();
        for _ in 0..3 {
            reg.enqueue("high", "x", json!({}), JobOptions::default()).unwrap();
        }

        assert!(matches!(reg.claim_next("high", LEASE).unwrap(), ClaimOutcome::Claimed(_)));
        assert!(matches!(reg.claim_next("high", LEASE).unwrap(), ClaimOutcome::Claimed(_)));
        match reg.claim_next("high", LEASE).unwrap() {
            ClaimOutcome::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(1000))
            }
            other => panic!("unexpected {other:?}"),
        }

        clock.advance(chrono::Duration::milliseconds(1000));
        assert!(matches!(reg.claim_next("high", LEASE).unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn bulk_reports_per_item_results() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("bulk", 5, 10)).unwrap();
        let mut stream = reg.bus().stream();

        let items = vec![
            BulkJob { options: JobOptions::default().with_job_id("a"), ..BulkJob::new("x", json!(1)) },
            BulkJob { options: JobOptions::default().with_job_id("a"), ..BulkJob::new("x", json!(2)) },
            BulkJob::new("", json!(3)),
            BulkJob::new("x", json!(4)),
        ];
        let results = reg.enqueue_bulk("bulk", items).unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind(), "VALIDATION_ERROR");
        assert!(results[2].is_err());
        assert!(results[3].is_ok());
        assert_eq!(reg.queue_status("bulk").unwrap().waiting, 2);

        let mut bulk = None;
        while let Ok(env) = stream.try_recv() {
            if let JobEvent::BulkCreated { count, first_job_id, .. } = env.event {
                bulk = Some((count, first_job_id));
            }
        }
        assert_eq!(bulk, Some((2, Some("a".to_string()))));
    }

    #[test]
    fn bulk_oversized_item_fails_alone() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("bulk", 5, 10)).unwrap();
        let mut stream = reg.bus().stream();

        let items = vec![
            BulkJob::new("x", json!({ "n": 1 })),
            BulkJob::new("x", json!({ "blob": "x".repeat(4096) })),
            BulkJob::new("x", json!({ "n": 3 })),
        ];
        let results = reg.enqueue_bulk("bulk", items).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("limit is 1024"));
        assert!(results[2].is_ok());

        let waiting = reg.list_jobs("bulk", JobStatus::Waiting, Page::new(0, 10)).unwrap();
        let payloads: Vec<_> = waiting.iter().map(|j| j.payload["n"].clone()).collect();
        assert_eq!(payloads, vec![json!(1), json!(3)]);

        let mut created = 0;
        let mut bulk_count = None;
        while let Ok(env) = stream.try_recv() {
            match env.event {
                JobEvent::Created { .. } => created += 1,
                JobEvent::BulkCreated { count, .. } => bulk_count = Some(count),
                _ => {}
            }
        }
        assert_eq!((created, bulk_count), (2, Some(2)));
    }

    #[test]
    fn defaults_apply_to_jobs_without_options() {
        let (reg, _) = setup();
        let defaults = JobDefaults { priority: 4, attempts: 7, timeout_ms: Some(500), ..JobDefaults::default() };
        reg.create_queue(QueueConfig::new("low", 4, 1).with_defaults(defaults)).unwrap();

        let h = reg.enqueue("low", "x", json!({}), JobOptions::default().with_attempts(2)).unwrap();
        let job = reg.get_job("low", &h.id).unwrap();
        assert_eq!((job.priority, job.max_attempts, job.timeout_ms), (4, 2, Some(500)));
    }

    #[test]
    fn cancel_only_pending_jobs() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();
        let a = reg.enqueue("normal", "x", json!({}), JobOptions::default()).unwrap();
        let b = reg.enqueue("normal", "x", json!({}), JobOptions::default()).unwrap();

        reg.cancel("normal", &b.id).unwrap();
        assert_eq!(reg.get_job("normal", &b.id).unwrap_err().kind(), "JOB_NOT_FOUND");

        claimed_id(reg.claim_next("normal", LEASE).unwrap());
        let err = reg.cancel("normal", &a.id).unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { status: JobStatus::Active, .. }));
    }

    #[test]
    fn clean_rejects_pending_states() {
        let (reg, _) = setup();
        reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();
        let err = reg.clean("normal", JobStatus::Waiting, Duration::ZERO, 10).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
        assert_eq!(reg.clean("normal", JobStatus::Completed, Duration::ZERO, 10).unwrap(), 0);
    }
}
