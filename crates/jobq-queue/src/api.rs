use std::sync::Arc;
use std::time::Duration;

use jobq_core::{Clock, JobOptions, JobStatus, JobqConfig, QueueConfig};
use jobq_events::{EventBus, JobEvent, QueueMetricsSnapshot};
use jobq_metrics::MetricsAggregator;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::db::{self, SharedConn};
use crate::dead_letter::DeadLetterStore;
use crate::dispatcher::Dispatcher;
use crate::error::{QueueError, Result};
use crate::processor::{Processor, ProcessorRegistry};
use crate::registry::QueueRegistry;
use crate::store::JobStore;
use crate::types::{BulkJob, DeadLetterFilter, DeadLetterRecord, Job, JobHandle, Page, QueueStatus};

/// The job system assembled from one configuration: queue registry,
/// processors, dispatcher, dead-letter store and metrics, all sharing one
/// event bus and one clock.
///
/// This is the surface producers and operators use; the background loops
/// are started with [`JobQueue::start`].
pub struct JobQueue {
    registry: Arc<QueueRegistry>,
    processors: Arc<ProcessorRegistry>,
    dead_letters: Arc<DeadLetterStore>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsAggregator>,
    metrics_every: Duration,
}

impl JobQueue {
    /// Open the configured database file and build the system.
    pub fn open(config: &JobqConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = db::open(&config.database.path)?;
        Self::with_connection(conn, config, clock)
    }

    /// Build on an already opened connection. Creates every configured
    /// queue.
    pub fn with_connection(conn: SharedConn, config: &JobqConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let bus = Arc::new(EventBus::new(Arc::clone(&clock)));
        let metrics = Arc::new(MetricsAggregator::new(Arc::clone(&clock), config.metrics.history_len));
        bus.subscribe("metrics", metrics.clone());

        let store = Arc::new(JobStore::new(conn));
        let registry = Arc::new(QueueRegistry::new(
            store,
            bus,
            clock,
            config.limits.max_payload_bytes,
        ));
        let processors = Arc::new(ProcessorRegistry::new());
        let dead_letters = Arc::new(DeadLetterStore::new(Arc::clone(&registry)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&processors),
            Arc::clone(&dead_letters),
            config.dispatcher.clone(),
        ));

        let jq = Self {
            registry,
            processors,
            dead_letters,
            dispatcher,
            metrics,
            metrics_every: Duration::from_secs(config.metrics.reset_interval_secs.max(1)),
        };
        for queue in config.queue_configs() {
            jq.create_queue(queue)?;
        }
        Ok(jq)
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.registry.bus()
    }

    pub fn create_queue(&self, config: QueueConfig) -> Result<()> {
        let name = config.name.clone();
        self.registry.create_queue(config)?;
        self.metrics.track_queue(&name);
        Ok(())
    }

    pub fn register_processor(&self, name: impl Into<String>, processor: Arc<dyn Processor>) {
        self.processors.register(name, processor);
    }

    /// Start one dispatcher loop per queue, the stall reaper and the
    /// metrics reset loop. All of them stop when `shutdown` flips to `true`.
    pub fn start(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = self.dispatcher.spawn_all(shutdown);
        handles.push(tokio::spawn(Arc::clone(&self.metrics).run(
            Arc::clone(self.registry.bus()),
            self.metrics_every,
            shutdown.clone(),
        )));
        info!(queues = self.registry.queue_names().len(), "job system started");
        handles
    }

    // -----------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------

    pub fn enqueue(&self, queue: &str, name: &str, payload: Value, opts: JobOptions) -> Result<JobHandle> {
        self.registry.enqueue(queue, name, payload, opts)
    }

    pub fn enqueue_bulk(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Result<JobHandle>>> {
        self.registry.enqueue_bulk(queue, jobs)
    }

    pub fn cancel(&self, queue: &str, id: &str) -> Result<()> {
        self.registry.cancel(queue, id)
    }

    /// Manual retry. A delayed job runs now; a failed job gets one more
    /// attempt. Any other state is rejected.
    pub fn retry_job(&self, queue: &str, id: &str) -> Result<JobHandle> {
        let job = self.registry.get_job(queue, id)?;
        let job = match job.status {
            JobStatus::Delayed => {
                self.registry.promote(queue, id)?;
                self.registry.get_job(queue, id)?
            }
            JobStatus::Failed => self.registry.retry_failed(queue, id)?,
            status => {
                return Err(QueueError::InvalidState {
                    id: id.to_string(),
                    status,
                    expected: "delayed or failed",
                });
            }
        };
        info!(queue, job_id = id, attempts_made = job.attempts_made, "job retried manually");
        self.bus().publish(JobEvent::Retried {
            queue: queue.to_string(),
            job_id: id.to_string(),
            attempts_made: job.attempts_made,
        });
        Ok(job.handle())
    }

    // -----------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------

    pub fn pause(&self, queue: &str) -> Result<()> {
        self.registry.pause(queue)
    }

    pub fn resume(&self, queue: &str) -> Result<()> {
        self.registry.resume(queue)
    }

    pub fn queue_status(&self, queue: &str) -> Result<QueueStatus> {
        self.registry.queue_status(queue)
    }

    pub fn all_queue_status(&self) -> Result<Vec<QueueStatus>> {
        self.registry.all_queue_status()
    }

    pub fn get_job(&self, queue: &str, id: &str) -> Result<Job> {
        self.registry.get_job(queue, id)
    }

    pub fn list_jobs(&self, queue: &str, status: JobStatus, page: Page) -> Result<Vec<Job>> {
        self.registry.list_jobs(queue, status, page)
    }

    pub fn clean(&self, queue: &str, status: JobStatus, grace: Duration, limit: usize) -> Result<usize> {
        self.registry.clean(queue, status, grace, limit)
    }

    pub fn metrics(&self, queue: &str) -> Result<QueueMetricsSnapshot> {
        self.metrics
            .current(queue)
            .ok_or_else(|| QueueError::QueueNotFound { queue: queue.to_string() })
    }

    pub fn all_metrics(&self) -> Vec<QueueMetricsSnapshot> {
        self.metrics.current_all()
    }

    pub fn metrics_history(&self, queue: &str) -> Vec<QueueMetricsSnapshot> {
        self.metrics.history(queue)
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn list_dead_letters(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<DeadLetterRecord>> {
        self.dead_letters.list(filter, page)
    }

    pub fn replay_dead_letter(&self, record_id: &str) -> Result<JobHandle> {
        self.dead_letters.replay(record_id)
    }

    pub fn purge_dead_letter(&self, record_id: &str) -> Result<()> {
        self.dead_letters.purge(record_id)
    }
}
