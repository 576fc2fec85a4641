use std::sync::Arc;

use jobq_core::JobOptions;
use jobq_events::JobEvent;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{from_ms, to_ms};
use crate::error::{QueueError, Result};
use crate::registry::QueueRegistry;
use crate::types::{DeadLetterFilter, DeadLetterRecord, Job, JobHandle, Page};

const DLR_COLUMNS: &str =
    "id, queue, job_id, job_name, payload, error, attempts_made, max_attempts, failed_at";

/// Terminal storage for jobs that ran out of attempts.
///
/// Records are never modified after capture; replay submits a fresh job and
/// leaves the record in place until an operator purges it.
pub struct DeadLetterStore {
    registry: Arc<QueueRegistry>,
}

impl DeadLetterStore {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }

    /// Fail `job` permanently and write its dead-letter record, in one
    /// transaction.
    ///
    /// Only applies while `job` is still held by the claim it was read
    /// under. Returns `None` when that claim has been lost, in which case
    /// nothing is written.
    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id))]
    pub fn capture(&self, job: &Job, error: &str) -> Result<Option<DeadLetterRecord>> {
        // Stored at millisecond precision; the returned record must match the row.
        let now = from_ms(to_ms(self.registry.clock().now()));
        let record = DeadLetterRecord {
            id: format!("dlr_{}", Uuid::now_v7().simple()),
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            payload: job.payload.clone(),
            error: error.to_string(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            failed_at: now,
        };

        {
            let mut conn = self.registry.store().conn().lock();
            let tx = conn.transaction()?;
            let n = tx.execute(
                "UPDATE jobs SET status = 'failed', attempts_made = ?4, failed_reason = ?5,
                        completed_at = ?6, lease_token = NULL, lease_until = NULL
                 WHERE queue = ?1 AND id = ?2 AND status = 'active' AND lease_token = ?3",
                params![job.queue, job.id, job.lease_token, job.attempts_made, error, to_ms(now)],
            )?;
            if n == 0 {
                warn!("claim lost before dead-lettering, record not written");
                return Ok(None);
            }
            tx.execute(
                &format!("INSERT INTO dead_letters ({DLR_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
                params![
                    record.id,
                    record.queue,
                    record.job_id,
                    record.job_name,
                    serde_json::to_string(&record.payload)?,
                    record.error,
                    record.attempts_made,
                    record.max_attempts,
                    to_ms(record.failed_at),
                ],
            )?;
            tx.commit()?;
        }

        warn!(record_id = %record.id, attempts = record.attempts_made, error, "job dead-lettered");
        self.registry.bus().publish(JobEvent::DeadLettered {
            queue: record.queue.clone(),
            job_id: record.job_id.clone(),
            record_id: record.id.clone(),
            error: record.error.clone(),
        });
        Ok(Some(record))
    }

    /// Records matching `filter`, newest first.
    pub fn list(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<DeadLetterRecord>> {
        let conn = self.registry.store().conn().lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {DLR_COLUMNS} FROM dead_letters
             WHERE (?1 IS NULL OR queue = ?1) AND (?2 IS NULL OR job_name = ?2)
             ORDER BY failed_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![filter.queue, filter.job_name, page.limit as i64, page.offset as i64],
            row_to_record,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count(&self, filter: &DeadLetterFilter) -> Result<u64> {
        let conn = self.registry.store().conn().lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dead_letters
             WHERE (?1 IS NULL OR queue = ?1) AND (?2 IS NULL OR job_name = ?2)",
            params![filter.queue, filter.job_name],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn get(&self, record_id: &str) -> Result<DeadLetterRecord> {
        let conn = self.registry.store().conn().lock();
        conn.query_row(
            &format!("SELECT {DLR_COLUMNS} FROM dead_letters WHERE id = ?1"),
            [record_id],
            row_to_record,
        )
        .optional()?
        .ok_or_else(|| QueueError::DeadLetterNotFound { id: record_id.to_string() })
    }

    /// Submit the record's payload as a brand-new job in its original
    /// queue. The record itself is left untouched.
    pub fn replay(&self, record_id: &str) -> Result<JobHandle> {
        let record = self.get(record_id)?;
        let handle = self.registry.enqueue(
            &record.queue,
            &record.job_name,
            record.payload,
            JobOptions::default().with_attempts(record.max_attempts),
        )?;
        info!(record_id, job_id = %handle.id, queue = %handle.queue, "dead letter replayed");
        Ok(handle)
    }

    /// Delete a record after review.
    pub fn purge(&self, record_id: &str) -> Result<()> {
        let conn = self.registry.store().conn().lock();
        let n = conn.execute("DELETE FROM dead_letters WHERE id = ?1", [record_id])?;
        if n == 0 {
            return Err(QueueError::DeadLetterNotFound { id: record_id.to_string() });
        }
        info!(record_id, "dead letter purged");
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    let payload: String = row.get(4)?;
    Ok(DeadLetterRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        job_id: row.get(2)?,
        job_name: row.get(3)?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        error: row.get(5)?,
        attempts_made: row.get(6)?,
        max_attempts: row.get(7)?,
        failed_at: from_ms(row.get(8)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::store::JobStore;
    use crate::types::ClaimOutcome;
    use chrono::Utc;
    use jobq_core::{JobStatus, ManualClock, QueueConfig};
    use jobq_events::EventBus;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<QueueRegistry>, DeadLetterStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(JobStore::new(open_in_memory().unwrap()));
        let bus = Arc::new(EventBus::new(clock.clone()));
        let reg = Arc::new(QueueRegistry::new(store, bus, clock, 64 * 1024));
        reg.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();
        reg.create_queue(QueueConfig::new("low", 4, 5)).unwrap();
        let dlq = DeadLetterStore::new(reg.clone());
        (reg, dlq)
    }

    fn claim(reg: &QueueRegistry, queue: &str) -> Job {
        match reg.claim_next(queue, Duration::from_secs(30)).unwrap() {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("expected claim, got {other:?}"),
        }
    }

    fn exhausted(reg: &QueueRegistry, queue: &str, name: &str) -> Job {
        reg.enqueue(queue, name, json!({ "n": 1 }), JobOptions::default()).unwrap();
        let mut job = claim(reg, queue);
        job.attempts_made = job.max_attempts;
        job
    }

    #[test]
    fn capture_fails_job_and_writes_record() {
        let (reg, dlq) = setup();
        let job = exhausted(&reg, "normal", "send");

        let record = dlq.capture(&job, "boom").unwrap().unwrap();
        assert_eq!(record.job_id, job.id);
        assert_eq!(record.error, "boom");

        let stored = reg.get_job("normal", &job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some("boom"));
        assert_eq!(dlq.get(&record.id).unwrap(), record);
    }

    #[test]
    fn capture_with_lost_claim_writes_nothing() {
        let (reg, dlq) = setup();
        let mut job = exhausted(&reg, "normal", "send");
        job.lease_token = Some("stale".into());

        assert!(dlq.capture(&job, "boom").unwrap().is_none());
        assert_eq!(dlq.count(&DeadLetterFilter::default()).unwrap(), 0);
        assert_eq!(reg.get_job("normal", &job.id).unwrap().status, JobStatus::Active);
    }

    #[test]
    fn list_filters_by_queue_and_name() {
        let (reg, dlq) = setup();
        dlq.capture(&exhausted(&reg, "normal", "send"), "e1").unwrap();
        dlq.capture(&exhausted(&reg, "low", "send"), "e2").unwrap();
        dlq.capture(&exhausted(&reg, "low", "resize"), "e3").unwrap();

        let low = DeadLetterFilter { queue: Some("low".into()), job_name: None };
        assert_eq!(dlq.list(&low, Page::default()).unwrap().len(), 2);

        let low_send = DeadLetterFilter { queue: Some("low".into()), job_name: Some("send".into()) };
        let records = dlq.list(&low_send, Page::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error, "e2");

        assert_eq!(dlq.list(&DeadLetterFilter::default(), Page::new(1, 1)).unwrap().len(), 1);
    }

    #[test]
    fn replay_submits_new_job_and_keeps_record() {
        let (reg, dlq) = setup();
        let job = exhausted(&reg, "normal", "send");
        let record = dlq.capture(&job, "boom").unwrap().unwrap();

        let handle = dlq.replay(&record.id).unwrap();
        assert_ne!(handle.id, job.id);
        assert_eq!(handle.queue, "normal");

        let fresh = reg.get_job("normal", &handle.id).unwrap();
        assert_eq!(fresh.attempts_made, 0);
        assert_eq!(fresh.status, JobStatus::Waiting);
        assert_eq!(fresh.payload, job.payload);
        assert_eq!(dlq.get(&record.id).unwrap(), record);
    }

    #[test]
    fn purge_removes_record() {
        let (reg, dlq) = setup();
        let record = dlq.capture(&exhausted(&reg, "normal", "send"), "boom").unwrap().unwrap();
        dlq.purge(&record.id).unwrap();
        assert_eq!(dlq.get(&record.id).unwrap_err().kind(), "DEAD_LETTER_NOT_FOUND");
        assert_eq!(dlq.purge(&record.id).unwrap_err().kind(), "DEAD_LETTER_NOT_FOUND");
    }
}
