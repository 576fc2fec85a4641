use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobq_core::JobStatus;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{from_ms, to_ms, SharedConn};
use crate::error::{QueueError, Result};
use crate::types::{Job, Page};

pub(crate) const JOB_COLUMNS: &str = "id, queue, name, payload, priority, status, attempts_made,
     max_attempts, backoff, timeout_ms, delay_until, created_at, processed_at, completed_at,
     progress, failed_reason, result, lease_token, lease_until, stall_count";

/// Eligible = claimable right now, in claim order.
const ELIGIBLE: &str = "queue = ?1
     AND (status IN ('waiting', 'stalled') OR (status = 'delayed' AND delay_until <= ?2))";

/// Outcome of the atomic claim transaction.
#[derive(Debug)]
pub(crate) enum StoreClaim {
    Claimed(Job),
    Empty { next_due: Option<DateTime<Utc>> },
    AtCapacity,
}

/// SQLite-backed job records, keyed by `(queue, id)`.
///
/// Every state-changing write that belongs to a claim carries the claim's
/// lease token and only applies while the job is still `active` under that
/// token. A worker that lost its lease therefore cannot overwrite the
/// outcome decided by whoever took the job over.
pub struct JobStore {
    conn: SharedConn,
}

impl JobStore {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    pub(crate) fn conn(&self) -> &SharedConn {
        &self.conn
    }

    pub fn insert(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock();
        let res = conn.execute(
            "INSERT INTO jobs
             (id, queue, name, payload, priority, status, attempts_made, max_attempts,
              backoff, timeout_ms, delay_until, created_at, progress, stall_count)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,0,0)",
            params![
                job.id,
                job.queue,
                job.name,
                serde_json::to_string(&job.payload)?,
                job.priority,
                job.status.as_str(),
                job.attempts_made,
                job.max_attempts,
                serde_json::to_string(&job.backoff)?,
                job.timeout_ms.map(|t| t as i64),
                job.delay_until.map(to_ms),
                to_ms(job.created_at),
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(QueueError::Validation(format!(
                    "job id {} already exists in queue {}",
                    job.id, job.queue
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        get_job(&conn, queue, id)
    }

    /// Jobs in `status`. Pending states come back in claim order, the rest
    /// newest first.
    pub fn list(&self, queue: &str, status: JobStatus, page: Page) -> Result<Vec<Job>> {
        let order = match status {
            JobStatus::Waiting | JobStatus::Delayed | JobStatus::Stalled => {
                "priority, created_at, seq"
            }
            _ => "seq DESC",
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 AND status = ?2
             ORDER BY {order} LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![queue, status.as_str(), page.limit as i64, page.offset as i64],
            row_to_job,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn counts(&self, queue: &str) -> Result<HashMap<JobStatus, u64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status")?;
        let rows = stmt.query_map([queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, n) = row?;
            if let Ok(status) = status.parse::<JobStatus>() {
                counts.insert(status, n as u64);
            }
        }
        Ok(counts)
    }

    /// Atomically pick the next eligible job and move it to `active`.
    ///
    /// The concurrency check, the selection and the update run in one
    /// transaction, so two claimers can never take the same job or push the
    /// queue past `concurrency`.
    pub(crate) fn claim(
        &self,
        queue: &str,
        concurrency: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        token: &str,
    ) -> Result<StoreClaim> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status = 'active'",
            [queue],
            |r| r.get(0),
        )?;
        if active as usize >= concurrency {
            return Ok(StoreClaim::AtCapacity);
        }

        let now_ms = to_ms(now);
        let next: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT seq FROM jobs WHERE {ELIGIBLE}
                     ORDER BY priority, created_at, seq LIMIT 1"
                ),
                params![queue, now_ms],
                |r| r.get(0),
            )
            .optional()?;

        let Some(seq) = next else {
            let next_due: Option<i64> = tx.query_row(
                "SELECT MIN(delay_until) FROM jobs WHERE queue = ?1 AND status = 'delayed'",
                [queue],
                |r| r.get(0),
            )?;
            return Ok(StoreClaim::Empty { next_due: next_due.map(from_ms) });
        };

        tx.execute(
            "UPDATE jobs SET status = 'active', processed_at = ?2, lease_token = ?3,
                    lease_until = ?4, delay_until = NULL
             WHERE seq = ?1",
            params![seq, now_ms, token, to_ms(lease_until)],
        )?;
        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE seq = ?1"),
            [seq],
            row_to_job,
        )?;
        tx.commit()?;
        Ok(StoreClaim::Claimed(job))
    }

    /// Extend the lease of an active claim. False if the claim was lost.
    pub(crate) fn renew_lease(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET lease_until = ?4
             WHERE queue = ?1 AND id = ?2 AND status = 'active' AND lease_token = ?3",
            params![queue, id, token, to_ms(until)],
        )?;
        Ok(n == 1)
    }

    pub(crate) fn update_progress(
        &self,
        queue: &str,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET progress = ?4
             WHERE queue = ?1 AND id = ?2 AND status = 'active' AND lease_token = ?3",
            params![queue, id, token, progress],
        )?;
        Ok(n == 1)
    }

    pub(crate) fn complete(
        &self,
        job: &Job,
        token: &str,
        now: DateTime<Utc>,
        result: &serde_json::Value,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET status = 'completed', completed_at = ?4, progress = 100,
                    result = ?5, lease_token = NULL, lease_until = NULL
             WHERE queue = ?1 AND id = ?2 AND status = 'active' AND lease_token = ?3",
            params![job.queue, job.id, token, to_ms(now), serde_json::to_string(result)?],
        )?;
        Ok(n == 1)
    }

    /// Park a failed job in `delayed` until its retry time.
    pub(crate) fn retry_later(&self, job: &Job, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET status = 'delayed', attempts_made = ?4, delay_until = ?5,
                    failed_reason = ?6, lease_token = NULL, lease_until = NULL
             WHERE queue = ?1 AND id = ?2 AND status = 'active' AND lease_token = ?3",
            params![
                job.queue,
                job.id,
                token,
                job.attempts_made,
                job.delay_until.map(to_ms),
                job.failed_reason,
            ],
        )?;
        Ok(n == 1)
    }

    /// Release an expired claim as `stalled` so it can be claimed again.
    pub(crate) fn mark_stalled(&self, job: &Job, token: &str, reason: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET status = 'stalled', stall_count = stall_count + 1,
                    failed_reason = ?4, lease_token = NULL, lease_until = NULL
             WHERE queue = ?1 AND id = ?2 AND status = 'active' AND lease_token = ?3",
            params![job.queue, job.id, token, reason],
        )?;
        Ok(n == 1)
    }

    /// Active jobs whose lease ran out before `now`, across all queues.
    pub(crate) fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'active' AND lease_until < ?1 ORDER BY seq"
        ))?;
        let rows = stmt.query_map([to_ms(now)], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove a job that has not been claimed yet.
    pub fn cancel(&self, queue: &str, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let job = get_job(&conn, queue, id)?
            .ok_or_else(|| QueueError::JobNotFound { queue: queue.to_string(), id: id.to_string() })?;
        if !job.status.is_cancellable() {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status: job.status,
                expected: "waiting or delayed",
            });
        }
        conn.execute("DELETE FROM jobs WHERE queue = ?1 AND id = ?2", params![queue, id])?;
        Ok(())
    }

    /// Make a delayed job claimable immediately.
    pub fn promote(&self, queue: &str, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET status = 'waiting', delay_until = NULL
             WHERE queue = ?1 AND id = ?2 AND status = 'delayed'",
            params![queue, id],
        )?;
        if n == 0 {
            return Err(not_in_state(&conn, queue, id, "delayed")?);
        }
        Ok(())
    }

    /// Grant a failed job one more attempt and put it back in `waiting`.
    /// Returns the updated job.
    pub fn retry_failed(&self, queue: &str, id: &str) -> Result<Job> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET status = 'waiting', max_attempts = MAX(max_attempts, attempts_made + 1),
                    completed_at = NULL, failed_reason = NULL
             WHERE queue = ?1 AND id = ?2 AND status = 'failed'",
            params![queue, id],
        )?;
        if n == 0 {
            return Err(not_in_state(&conn, queue, id, "failed")?);
        }
        get_job(&conn, queue, id)?
            .ok_or_else(|| QueueError::JobNotFound { queue: queue.to_string(), id: id.to_string() })
    }

    /// Delete up to `limit` terminal jobs in `status` that finished before
    /// `older_than`. Returns the number removed.
    pub fn clean(
        &self,
        queue: &str,
        status: JobStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM jobs WHERE seq IN (
                 SELECT seq FROM jobs
                 WHERE queue = ?1 AND status = ?2
                   AND COALESCE(completed_at, created_at) < ?3
                 ORDER BY seq LIMIT ?4)",
            params![queue, status.as_str(), to_ms(older_than), limit as i64],
        )?;
        Ok(n)
    }
}

pub(crate) fn get_job(conn: &Connection, queue: &str, id: &str) -> Result<Option<Job>> {
    Ok(conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 AND id = ?2"),
            params![queue, id],
            row_to_job,
        )
        .optional()?)
}

/// Build the error for a conditional write that matched no row.
fn not_in_state(conn: &Connection, queue: &str, id: &str, expected: &'static str) -> Result<QueueError> {
    Ok(match get_job(conn, queue, id)? {
        Some(job) => QueueError::InvalidState { id: id.to_string(), status: job.status, expected },
        None => QueueError::JobNotFound { queue: queue.to_string(), id: id.to_string() },
    })
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a row selected with [`JOB_COLUMNS`] to a `Job`.
pub(crate) fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(5)?;
    let status = status.parse::<JobStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;
    let result: Option<String> = row.get(16)?;
    Ok(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        name: row.get(2)?,
        payload: json_col(row, 3)?,
        priority: row.get(4)?,
        status,
        attempts_made: row.get(6)?,
        max_attempts: row.get(7)?,
        backoff: json_col(row, 8)?,
        timeout_ms: row.get::<_, Option<i64>>(9)?.map(|t| t as u64),
        delay_until: row.get::<_, Option<i64>>(10)?.map(from_ms),
        created_at: from_ms(row.get(11)?),
        processed_at: row.get::<_, Option<i64>>(12)?.map(from_ms),
        completed_at: row.get::<_, Option<i64>>(13)?.map(from_ms),
        progress: row.get(14)?,
        failed_reason: row.get(15)?,
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        lease_token: row.get(17)?,
        lease_until: row.get::<_, Option<i64>>(18)?.map(from_ms),
        stall_count: row.get(19)?,
    })
}
