use std::sync::Arc;
use std::time::Duration;

use jobq_core::config::DispatcherConfig;
use jobq_events::JobEvent;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::dead_letter::DeadLetterStore;
use crate::error::{QueueError, Result};
use crate::processor::{ProcessorRegistry, ProgressReporter};
use crate::registry::QueueRegistry;
use crate::retry::{RetryController, RetryDecision};
use crate::types::{ClaimOutcome, Job};

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed and parked in `delayed` for another attempt.
    Retrying { delay_ms: u64 },
    /// Failed for good; a dead-letter record exists.
    DeadLettered,
    /// Released as `stalled` and claimable again.
    Stalled,
    /// Another worker took the job over first; nothing was written.
    LostClaim,
}

/// Pulls jobs from the queue registry, runs them through their processor and
/// records the outcome. One dispatcher serves every queue; each queue gets
/// its own loop via [`Dispatcher::run_queue`].
pub struct Dispatcher {
    registry: Arc<QueueRegistry>,
    processors: Arc<ProcessorRegistry>,
    dead_letters: Arc<DeadLetterStore>,
    retry: RetryController,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<QueueRegistry>,
        processors: Arc<ProcessorRegistry>,
        dead_letters: Arc<DeadLetterStore>,
        config: DispatcherConfig,
    ) -> Self {
        let retry = RetryController::new(config.max_backoff_ms);
        Self { registry, processors, dead_letters, retry, config }
    }

    fn lease(&self) -> Duration {
        Duration::from_millis(self.config.lease_timeout_ms)
    }

    /// Claim one job from `queue` and run it to an outcome on the current
    /// task. `None` when nothing could be claimed.
    pub async fn process_next(&self, queue: &str) -> Result<Option<JobOutcome>> {
        match self.registry.claim_next(queue, self.lease())? {
            ClaimOutcome::Claimed(job) => self.execute(job).await.map(Some),
            other => {
                debug!(queue, outcome = ?other, "nothing claimed");
                Ok(None)
            }
        }
    }

    /// Run a claimed job through its processor and record the result.
    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id, job_name = %job.name))]
    pub async fn execute(&self, job: Job) -> Result<JobOutcome> {
        let bus = self.registry.bus();
        let token = job.lease_token.clone().unwrap_or_default();

        let Some(processor) = self.processors.get(&job.name) else {
            let err = QueueError::ProcessorNotFound { name: job.name.clone() };
            error!(error = %err, "job cannot run");
            bus.publish(JobEvent::QueueError { queue: job.queue.clone(), error: err.to_string() });
            bus.publish(JobEvent::Failed {
                queue: job.queue.clone(),
                job_id: job.id.clone(),
                job_name: job.name.clone(),
                error: err.to_string(),
                attempts_made: job.attempts_made,
                will_retry: false,
                duration_ms: 0,
            });
            return self.dead_letter(job, err.to_string()).await;
        };

        bus.publish(JobEvent::Active {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            attempts_made: job.attempts_made,
        });

        info!(attempt = job.attempts_made + 1, max = job.max_attempts, "job started");
        // Jobs without their own timeout still get the dispatcher-wide cap.
        let budget_ms = job.timeout_ms.unwrap_or(self.config.max_execution_ms);
        let budget = Duration::from_millis(budget_ms);
        let heartbeat = self.spawn_heartbeat(&job, &token, budget);
        let reporter = ProgressReporter::new(
            Arc::clone(self.registry.store()),
            Arc::clone(bus),
            job.queue.clone(),
            job.id.clone(),
            token.clone(),
        );

        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { processor.process(payload, reporter).await });
        let outcome = tokio::time::timeout(budget, &mut task).await;
        heartbeat.abort();

        match outcome {
            Ok(Ok(Ok(value))) => self.complete(job, &token, value),
            Ok(Ok(Err(e))) => self.fail(job, e.to_string()).await,
            Ok(Err(join_err)) => self.fail(job, format!("processor panicked: {join_err}")).await,
            Err(_) => {
                task.abort();
                let reason = format!("no result within {budget_ms}ms");
                warn!(%reason, "job timed out");
                self.stall(job, &reason).await
            }
        }
    }

    /// Renew the lease every heartbeat interval until aborted, the claim is
    /// lost or `budget` has passed. After that the lease runs out and the
    /// stall reaper takes the job.
    fn spawn_heartbeat(&self, job: &Job, token: &str, budget: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let every = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let lease_ms = self.config.lease_timeout_ms as i64;
        let (queue, id, token) = (job.queue.clone(), job.id.clone(), token.to_string());

        tokio::spawn(async move {
            let stop_at = tokio::time::Instant::now() + budget;
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                if tokio::time::Instant::now() >= stop_at {
                    warn!(job_id = %id, "execution budget spent, lease no longer renewed");
                    break;
                }
                let until = registry.clock().now() + chrono::Duration::milliseconds(lease_ms);
                match registry.store().renew_lease(&queue, &id, &token, until) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %id, "lease lost, heartbeat stopped");
                        break;
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "lease renewal failed"),
                }
            }
        })
    }

    fn complete(&self, job: Job, token: &str, result: Value) -> Result<JobOutcome> {
        let now = self.registry.clock().now();
        if !self.registry.store().complete(&job, token, now, &result)? {
            warn!("claim lost before completion, result discarded");
            return Ok(JobOutcome::LostClaim);
        }
        let duration_ms = job.elapsed_ms(now);
        info!(duration_ms, "job completed");
        self.registry.bus().publish(JobEvent::Completed {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            duration_ms,
            attempts_made: job.attempts_made,
        });
        Ok(JobOutcome::Completed)
    }

    /// One failed execution: retry with backoff or dead-letter.
    async fn fail(&self, mut job: Job, error: String) -> Result<JobOutcome> {
        let now = self.registry.clock().now();
        let duration_ms = job.elapsed_ms(now);
        let token = job.lease_token.clone().unwrap_or_default();
        job.failed_reason = Some(error.clone());

        match self.retry.decide(&mut job, now) {
            RetryDecision::Retry { attempts_made, delay_ms, retry_at } => {
                if !self.registry.store().retry_later(&job, &token)? {
                    warn!("claim lost before retry was recorded");
                    return Ok(JobOutcome::LostClaim);
                }
                warn!(attempts_made, delay_ms, %retry_at, %error, "job failed, retrying");
                self.registry.bus().publish(JobEvent::Failed {
                    queue: job.queue.clone(),
                    job_id: job.id.clone(),
                    job_name: job.name.clone(),
                    error,
                    attempts_made,
                    will_retry: true,
                    duration_ms,
                });
                self.registry.wake_handle(&job.queue)?.notify_one();
                Ok(JobOutcome::Retrying { delay_ms })
            }
            RetryDecision::Exhausted { attempts_made } => {
                let exhausted = QueueError::MaxAttemptsExceeded { id: job.id.clone(), attempts: attempts_made };
                error!(error = %error, "{exhausted}");
                self.registry.bus().publish(JobEvent::Failed {
                    queue: job.queue.clone(),
                    job_id: job.id.clone(),
                    job_name: job.name.clone(),
                    error: error.clone(),
                    attempts_made,
                    will_retry: false,
                    duration_ms,
                });
                self.dead_letter(job, error).await
            }
        }
    }

    async fn dead_letter(&self, job: Job, error: String) -> Result<JobOutcome> {
        Ok(match self.dead_letters.capture(&job, &error)? {
            Some(_) => JobOutcome::DeadLettered,
            None => JobOutcome::LostClaim,
        })
    }

    /// A claim that produced no result in time. Released for another claim
    /// while re-claims remain, otherwise counted as a failed execution.
    async fn stall(&self, job: Job, reason: &str) -> Result<JobOutcome> {
        if job.stall_count >= self.config.max_stalled_reclaims {
            let err = QueueError::StallTimeout { id: job.id.clone(), reason: reason.to_string() };
            return self.fail(job, err.to_string()).await;
        }

        let token = job.lease_token.clone().unwrap_or_default();
        if !self.registry.store().mark_stalled(&job, &token, reason)? {
            return Ok(JobOutcome::LostClaim);
        }
        let stall_count = job.stall_count + 1;
        warn!(queue = %job.queue, job_id = %job.id, stall_count, reason, "job stalled");
        self.registry.bus().publish(JobEvent::Stalled {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            stall_count,
        });
        self.registry.wake_handle(&job.queue)?.notify_one();
        Ok(JobOutcome::Stalled)
    }

    /// Release or fail every active job whose lease has expired. Returns
    /// the number of jobs handled.
    pub async fn reap_stalled(&self) -> Result<usize> {
        let now = self.registry.clock().now();
        let expired = self.registry.store().expired_leases(now)?;
        let mut handled = 0;
        for job in expired {
            let outcome = self.stall(job, "lease expired").await?;
            if outcome != JobOutcome::LostClaim {
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Claim-and-run loop for one queue until `shutdown` flips to `true`.
    ///
    /// Up to the queue's concurrency jobs run at once, each on its own
    /// task. On shutdown no new jobs are claimed and in-flight jobs are
    /// awaited before returning.
    pub async fn run_queue(self: Arc<Self>, queue: String, mut shutdown: watch::Receiver<bool>) {
        let wake = match self.registry.wake_handle(&queue) {
            Ok(w) => w,
            Err(e) => {
                error!(%queue, "dispatcher not started: {e}");
                return;
            }
        };
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut inflight: JoinSet<()> = JoinSet::new();
        info!(%queue, "dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.registry.claim_next(&queue, self.lease()) {
                Ok(ClaimOutcome::Claimed(job)) => {
                    let this = Arc::clone(&self);
                    inflight.spawn(async move {
                        let id = job.id.clone();
                        if let Err(e) = this.execute(job).await {
                            error!(job_id = %id, kind = e.kind(), "job outcome not recorded: {e}");
                        }
                    });
                    continue;
                }
                Ok(ClaimOutcome::AtCapacity) => poll,
                Ok(ClaimOutcome::Paused) => poll,
                Ok(ClaimOutcome::RateLimited { retry_after }) => {
                    let deferred = QueueError::RateLimited {
                        queue: queue.clone(),
                        retry_after_ms: retry_after.as_millis() as u64,
                    };
                    debug!(kind = deferred.kind(), "{deferred}");
                    retry_after
                }
                Ok(ClaimOutcome::Empty { next_due }) => next_due
                    .and_then(|due| (due - self.registry.clock().now()).to_std().ok())
                    .map_or(poll, |d| d.min(poll)),
                Err(e) if e.is_store_failure() => {
                    error!(%queue, kind = e.kind(), "claim failed, backing off: {e}");
                    self.registry
                        .bus()
                        .publish(JobEvent::QueueError { queue: queue.clone(), error: e.to_string() });
                    Duration::from_millis(self.config.store_error_backoff_ms)
                }
                Err(e) => {
                    error!(%queue, kind = e.kind(), "claim failed: {e}");
                    poll
                }
            };

            tokio::select! {
                _ = wake.notified() => {}
                Some(res) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = res {
                        error!(%queue, "job task panicked: {e}");
                    }
                }
                _ = tokio::time::sleep(wait) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        info!(%queue, in_flight = inflight.len(), "dispatcher draining");
        while let Some(res) = inflight.join_next().await {
            if let Err(e) = res {
                error!(%queue, "job task panicked: {e}");
            }
        }
        info!(%queue, "dispatcher stopped");
    }

    /// Periodic stall check until `shutdown` flips to `true`.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.stall_check_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reap_stalled().await {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "stalled jobs handled"),
                        Err(e) => error!("stall check failed: {e}"),
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("stall reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Start a loop for every registered queue plus the stall reaper.
    pub fn spawn_all(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .registry
            .queue_names()
            .into_iter()
            .map(|q| tokio::spawn(Arc::clone(self).run_queue(q, shutdown.clone())))
            .collect();
        handles.push(tokio::spawn(Arc::clone(self).run_reaper(shutdown.clone())));
        handles
    }
}
