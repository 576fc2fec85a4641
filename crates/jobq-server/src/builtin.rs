//! Processors available in every `jobq run` process, for smoke testing a
//! deployment and for schedules that only need a heartbeat.

use std::time::Duration;

use async_trait::async_trait;
use jobq_queue::{processor_fn, JobQueue, Processor, ProcessorError, ProgressReporter};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

pub fn register(jq: &JobQueue) {
    jq.register_processor("noop", processor_fn(|_, _| async { Ok(Value::Null) }));
    jq.register_processor("echo", processor_fn(|payload, _| async move { Ok(payload) }));
    jq.register_processor(
        "log",
        processor_fn(|payload, _| async move {
            info!(%payload, "log job");
            Ok(Value::Null)
        }),
    );
    jq.register_processor("sleep", std::sync::Arc::new(Sleep));
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
    #[serde(default = "default_steps")]
    steps: u32,
}

fn default_steps() -> u32 {
    4
}

/// Sleeps `ms` milliseconds in `steps` slices, reporting progress after each.
struct Sleep;

#[async_trait]
impl Processor for Sleep {
    async fn process(&self, payload: Value, progress: ProgressReporter) -> Result<Value, ProcessorError> {
        let args: SleepArgs = serde_json::from_value(payload)?;
        let steps = args.steps.max(1);
        let slice = Duration::from_millis(args.ms / u64::from(steps));
        for step in 1..=steps {
            tokio::time::sleep(slice).await;
            progress.report((step * 100 / steps) as u8);
        }
        Ok(json!({ "slept_ms": args.ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_rejects_malformed_payload() {
        let err = Sleep.process(json!({ "ms": "soon" }), ProgressReporter::detached()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn sleep_returns_duration() {
        let out = Sleep
            .process(json!({ "ms": 4, "steps": 2 }), ProgressReporter::detached())
            .await
            .unwrap();
        assert_eq!(out, json!({ "slept_ms": 4 }));
    }
}
