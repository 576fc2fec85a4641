use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jobq_core::Clock;
use jobq_events::{EventBus, EventEnvelope, EventHandler, JobEvent, QueueMetricsSnapshot};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    stalled: AtomicU64,
    total_processing_ms: AtomicU64,
}

struct QueueMetrics {
    counters: Counters,
    window_start: Mutex<DateTime<Utc>>,
}

impl QueueMetrics {
    fn new(start: DateTime<Utc>) -> Self {
        Self { counters: Counters::default(), window_start: Mutex::new(start) }
    }

    fn read(&self, queue: &str, now: DateTime<Utc>) -> QueueMetricsSnapshot {
        let c = &self.counters;
        build_snapshot(
            queue,
            [
                c.processed.load(Ordering::Relaxed),
                c.completed.load(Ordering::Relaxed),
                c.failed.load(Ordering::Relaxed),
                c.active.load(Ordering::Relaxed),
                c.stalled.load(Ordering::Relaxed),
                c.total_processing_ms.load(Ordering::Relaxed),
            ],
            *self.window_start.lock(),
            now,
        )
    }

    /// Caller must hold the aggregator's reset gate exclusively.
    fn take(&self, queue: &str, now: DateTime<Utc>) -> QueueMetricsSnapshot {
        let c = &self.counters;
        let mut start = self.window_start.lock();
        let snap = build_snapshot(
            queue,
            [
                c.processed.swap(0, Ordering::Relaxed),
                c.completed.swap(0, Ordering::Relaxed),
                c.failed.swap(0, Ordering::Relaxed),
                c.active.swap(0, Ordering::Relaxed),
                c.stalled.swap(0, Ordering::Relaxed),
                c.total_processing_ms.swap(0, Ordering::Relaxed),
            ],
            *start,
            now,
        );
        *start = now;
        snap
    }
}

fn build_snapshot(
    queue: &str,
    [processed, completed, failed, active, stalled, total_ms]: [u64; 6],
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> QueueMetricsSnapshot {
    let ratio = |num: u64| if processed == 0 { 0.0 } else { num as f64 / processed as f64 };
    let minutes = (now - window_start).num_milliseconds() as f64 / 60_000.0;
    QueueMetricsSnapshot {
        queue: queue.to_string(),
        processed,
        completed,
        failed,
        active,
        stalled,
        total_processing_ms: total_ms,
        avg_processing_ms: ratio(total_ms),
        success_rate: ratio(completed),
        throughput_per_min: if minutes > 0.0 { processed as f64 / minutes } else { 0.0 },
        window_start,
        taken_at: now,
    }
}

/// Maintains live per-queue counters from bus events and a bounded history
/// of past windows.
pub struct MetricsAggregator {
    queues: DashMap<String, Arc<QueueMetrics>>,
    /// Shared by increments, exclusive for snapshot-and-reset.
    gate: RwLock<()>,
    /// Highest seq applied; redelivered envelopes are ignored.
    last_seq: AtomicU64,
    history: Mutex<HashMap<String, VecDeque<QueueMetricsSnapshot>>>,
    history_len: usize,
    clock: Arc<dyn Clock>,
}

impl MetricsAggregator {
    pub fn new(clock: Arc<dyn Clock>, history_len: usize) -> Self {
        Self {
            queues: DashMap::new(),
            gate: RwLock::new(()),
            last_seq: AtomicU64::new(0),
            history: Mutex::new(HashMap::new()),
            history_len,
            clock,
        }
    }

    /// Start a zeroed window for `queue`. Events for queues that were never
    /// tracked are ignored.
    pub fn track_queue(&self, queue: &str) {
        let now = self.clock.now();
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueMetrics::new(now)));
    }

    fn apply(&self, event: &JobEvent) {
        let Some(m) = self.queues.get(event.queue()).map(|m| Arc::clone(&m)) else {
            return;
        };
        let bump = |f: fn(&Counters) -> &AtomicU64, by: u64| {
            f(&m.counters).fetch_add(by, Ordering::Relaxed);
        };
        match event {
            JobEvent::Active { .. } => bump(|c| &c.active, 1),
            JobEvent::Completed { duration_ms, .. } => {
                bump(|c| &c.completed, 1);
                bump(|c| &c.processed, 1);
                bump(|c| &c.total_processing_ms, *duration_ms);
            }
            JobEvent::Failed { duration_ms, .. } => {
                bump(|c| &c.failed, 1);
                bump(|c| &c.processed, 1);
                bump(|c| &c.total_processing_ms, *duration_ms);
            }
            JobEvent::Stalled { .. } => bump(|c| &c.stalled, 1),
            _ => {}
        }
    }

    /// Live counters for one queue, without resetting.
    pub fn current(&self, queue: &str) -> Option<QueueMetricsSnapshot> {
        let now = self.clock.now();
        let _shared = self.gate.read();
        self.queues.get(queue).map(|m| m.read(queue, now))
    }

    /// Live counters for every known queue, sorted by name.
    pub fn current_all(&self) -> Vec<QueueMetricsSnapshot> {
        let now = self.clock.now();
        let _shared = self.gate.read();
        let mut all: Vec<_> = self.queues.iter().map(|e| e.value().read(e.key(), now)).collect();
        all.sort_by(|a, b| a.queue.cmp(&b.queue));
        all
    }

    /// Past windows for `queue`, oldest first.
    pub fn history(&self, queue: &str) -> Vec<QueueMetricsSnapshot> {
        self.history
            .lock()
            .get(queue)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Capture every queue's window and zero it, atomically with respect to
    /// concurrent increments. Snapshots are appended to history and returned.
    pub fn snapshot_and_reset(&self) -> Vec<QueueMetricsSnapshot> {
        let now = self.clock.now();
        let mut snaps: Vec<_> = {
            let _exclusive = self.gate.write();
            self.queues.iter().map(|e| e.value().take(e.key(), now)).collect()
        };
        snaps.sort_by(|a, b| a.queue.cmp(&b.queue));

        let mut history = self.history.lock();
        for snap in &snaps {
            let h = history.entry(snap.queue.clone()).or_default();
            h.push_back(snap.clone());
            while h.len() > self.history_len {
                h.pop_front();
            }
        }
        debug!(queues = snaps.len(), "metrics window closed");
        snaps
    }

    /// Periodic snapshot-and-reset. Each snapshot is published as a
    /// `metrics:snapshot` event before the next window starts collecting.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<EventBus>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(every_secs = every.as_secs(), "metrics reset loop started");
        let mut interval = tokio::time::interval(every);
        // First tick completes immediately; the first window should be full.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for snap in self.snapshot_and_reset() {
                        bus.publish(JobEvent::MetricsSnapshot(snap));
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("metrics reset loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl EventHandler for MetricsAggregator {
    fn handle(&self, envelope: &EventEnvelope) {
        if self.last_seq.fetch_max(envelope.seq, Ordering::SeqCst) >= envelope.seq {
            return;
        }
        let _shared = self.gate.read();
        self.apply(&envelope.event);
    }
}
