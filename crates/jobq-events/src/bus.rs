use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use jobq_core::Clock;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::types::{EventEnvelope, EventKind, JobEvent};

const STREAM_CAPACITY: usize = 1024;

/// Synchronous event observer.
///
/// Handlers run on the publisher's task, in emission order, so they must be
/// cheap and must not publish back into the same bus.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EventEnvelope);
}

struct Subscription {
    /// Unique name used for unsubscription and log correlation.
    name: String,
    /// `None` receives every kind.
    kinds: Option<Vec<EventKind>>,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

/// Fan-out point for every [`JobEvent`] in the process.
///
/// Share it as `Arc<EventBus>`; all components publish into the same
/// instance so `seq` gives one total order.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscription>>,
    /// Serialises seq assignment with delivery so handlers observe events
    /// in exactly the order their seq numbers say.
    ordering: Mutex<()>,
    seq: AtomicU64,
    stream: broadcast::Sender<EventEnvelope>,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            subscribers: RwLock::new(Vec::new()),
            ordering: Mutex::new(()),
            seq: AtomicU64::new(0),
            stream,
            clock,
        }
    }

    /// Register a handler for every event kind.
    pub fn subscribe(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.push(name.into(), None, handler);
    }

    /// Register a handler that only sees the listed kinds.
    pub fn subscribe_to(
        &self,
        name: impl Into<String>,
        kinds: &[EventKind],
        handler: Arc<dyn EventHandler>,
    ) {
        self.push(name.into(), Some(kinds.to_vec()), handler);
    }

    fn push(&self, name: String, kinds: Option<Vec<EventKind>>, handler: Arc<dyn EventHandler>) {
        debug!(subscriber = %name, "event subscriber registered");
        self.subscribers.write().push(Subscription { name, kinds, handler });
    }

    /// Remove a subscriber by name. Silent no-op if the name is unknown.
    pub fn unsubscribe(&self, name: &str) {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.name != name);
        if subs.len() < before {
            debug!(subscriber = name, "event subscriber removed");
        }
    }

    /// Async receiver of every event published from now on. Slow receivers
    /// lag and lose the oldest events rather than blocking publishers.
    pub fn stream(&self) -> broadcast::Receiver<EventEnvelope> {
        self.stream.subscribe()
    }

    /// Stamp, deliver to handlers, then broadcast. Returns the assigned seq.
    pub fn publish(&self, event: JobEvent) -> u64 {
        let _order = self.ordering.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = EventEnvelope { seq, emitted_at: self.clock.now(), event };
        let kind = envelope.event.kind();

        trace!(seq, event = envelope.event.name(), queue = envelope.event.queue(), "publish");

        {
            let subs = self.subscribers.read();
            for sub in subs.iter().filter(|s| s.wants(kind)) {
                sub.handler.handle(&envelope);
            }
        }

        // No live receivers is not an error.
        let _ = self.stream.send(envelope);
        seq
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobq_core::ManualClock;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, EventKind)>>);

    impl EventHandler for Recorder {
        fn handle(&self, event: &EventEnvelope) {
            self.0.lock().push((event.seq, event.event.kind()));
        }
    }

    fn bus() -> EventBus {
        EventBus::new(Arc::new(ManualClock::new(Utc::now())))
    }

    fn paused(q: &str) -> JobEvent {
        JobEvent::QueuePaused { queue: q.to_string() }
    }

    #[test]
    fn handlers_see_events_in_publish_order() {
        let bus = bus();
        let rec = Arc::new(Recorder::default());
        bus.subscribe("rec", rec.clone());

        bus.publish(paused("a"));
        bus.publish(JobEvent::QueueResumed { queue: "a".into() });

        let seen = rec.0.lock().clone();
        assert_eq!(seen, vec![(1, EventKind::QueuePaused), (2, EventKind::QueueResumed)]);
        assert_eq!(bus.published(), 2);
    }

    #[test]
    fn filtered_subscription_skips_other_kinds() {
        let bus = bus();
        let rec = Arc::new(Recorder::default());
        bus.subscribe_to("resumes", &[EventKind::QueueResumed], rec.clone());

        bus.publish(paused("a"));
        bus.publish(JobEvent::QueueResumed { queue: "a".into() });

        assert_eq!(rec.0.lock().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = bus();
        let rec = Arc::new(Recorder::default());
        bus.subscribe("rec", rec.clone());
        bus.unsubscribe("rec");
        bus.publish(paused("a"));
        assert!(rec.0.lock().is_empty());
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let bus = bus();
        let mut rx = bus.stream();
        bus.publish(paused("bulk"));
        let env = rx.recv().await.unwrap();
        assert_eq!(env.seq, 1);
        assert_eq!(env.event, paused("bulk"));
    }
}
