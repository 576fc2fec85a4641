use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use jobq_events::{EventBus, JobEvent};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::JobStore;

/// Failure reported by a processor. The message becomes the job's
/// `failed_reason`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessorError(pub String);

impl ProcessorError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<String> for ProcessorError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for ProcessorError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Executes jobs of one name. Success carries an optional result value that
/// is stored on the job record.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, payload: Value, progress: ProgressReporter) -> Result<Value, ProcessorError>;
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<Value, ProcessorError>> + Send>>;

/// Adapter that lets a plain async closure act as a [`Processor`].
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(Value, ProgressReporter) -> BoxFuture + Send + Sync,
{
    async fn process(&self, payload: Value, progress: ProgressReporter) -> Result<Value, ProcessorError> {
        (self.f)(payload, progress).await
    }
}

/// Wrap an async closure as a shareable processor.
///
/// ```ignore
/// registry.register("send_email", processor_fn(|payload, _progress| async move {
///     Ok(serde_json::json!({ "sent": payload["to"] }))
/// }));
/// ```
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Value, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessorError>> + Send + 'static,
{
    let boxed = move |payload: Value, progress: ProgressReporter| -> BoxFuture {
        Box::pin(f(payload, progress))
    };
    Arc::new(FnProcessor { f: boxed })
}

/// Job name to processor table, shared by every dispatcher.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the processor for `name`.
    pub fn register(&self, name: impl Into<String>, processor: Arc<dyn Processor>) {
        let name = name.into();
        debug!(job_name = %name, "processor registered");
        self.processors.write().insert(name, processor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names from `wanted` that have no processor, for startup validation.
    pub fn missing<'a>(&self, wanted: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let processors = self.processors.read();
        wanted
            .into_iter()
            .filter(|n| !processors.contains_key(*n))
            .map(str::to_string)
            .collect()
    }
}

/// Handle given to a running processor for advisory progress updates.
///
/// Updates only land while the claim that created the handle still holds
/// the job; after a stall or timeout they are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Option<Arc<ProgressTarget>>,
}

struct ProgressTarget {
    store: Arc<JobStore>,
    bus: Arc<EventBus>,
    queue: String,
    job_id: String,
    token: String,
}

impl ProgressReporter {
    pub(crate) fn new(
        store: Arc<JobStore>,
        bus: Arc<EventBus>,
        queue: String,
        job_id: String,
        token: String,
    ) -> Self {
        Self { inner: Some(Arc::new(ProgressTarget { store, bus, queue, job_id, token })) }
    }

    /// A reporter that goes nowhere, for calling processors directly.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    /// Record progress, clamped to 0-100.
    pub fn report(&self, progress: u8) {
        let Some(t) = &self.inner else { return };
        let progress = progress.min(100);
        match t.store.update_progress(&t.queue, &t.job_id, &t.token, progress) {
            Ok(true) => {
                t.bus.publish(JobEvent::Progress {
                    queue: t.queue.clone(),
                    job_id: t.job_id.clone(),
                    progress,
                });
            }
            Ok(false) => debug!(job_id = %t.job_id, "progress after claim was lost, ignored"),
            Err(e) => warn!(job_id = %t.job_id, error = %e, "progress update failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_processor_runs() {
        let p = processor_fn(|payload, _| async move { Ok(json!({ "echo": payload })) });
        let out = p.process(json!(7), ProgressReporter::detached()).await.unwrap();
        assert_eq!(out, json!({ "echo": 7 }));
    }

    #[test]
    fn registry_reports_missing_names() {
        let reg = ProcessorRegistry::new();
        reg.register("a", processor_fn(|_, _| async { Ok(Value::Null) }));
        assert!(reg.get("a").is_some());
        assert_eq!(reg.missing(["a", "b"]), vec!["b".to_string()]);
        assert_eq!(reg.names(), vec!["a".to_string()]);
    }
}
