//! `jobq-metrics` — per-queue counters fed by the event bus.
//!
//! Counters are plain atomics; a reset takes an exclusive gate so that a
//! snapshot and the zeroing that follows it see exactly the same set of
//! increments.

pub mod aggregator;

pub use aggregator::MetricsAggregator;
pub use jobq_events::QueueMetricsSnapshot;
