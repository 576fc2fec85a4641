//! `jobq-events` — typed lifecycle events and the bus that fans them out.
//!
//! Two delivery paths exist side by side:
//!
//! | Path                 | Delivery                                    | Used by             |
//! |----------------------|---------------------------------------------|---------------------|
//! | [`EventHandler`]     | synchronous, in publish order, every event  | metrics aggregator  |
//! | [`EventBus::stream`] | `tokio::sync::broadcast`, lossy when lagging | CLI tail, listeners |

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventHandler};
pub use types::{EventEnvelope, EventKind, JobEvent, QueueMetricsSnapshot};
