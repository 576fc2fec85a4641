use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobq_core::{Clock, JobOptions};
use jobq_events::JobEvent;
use jobq_queue::db::SharedConn;
use jobq_queue::QueueRegistry;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::{materialize, CronSpec, TickContext},
    types::{NewSchedule, ScheduledJobDefinition},
};

/// Longest the loop sleeps without re-checking, even with nothing due.
const MAX_IDLE: Duration = Duration::from_secs(60);
/// Seconds before a definition whose tick failed is tried again.
const RETRY_AFTER_ERROR_SECS: i64 = 60;

const COLUMNS: &str = "id, name, cron, timezone, queue, job_name, payload, options,
     next_run_at, last_run_at, run_count, created_at";

type DueHeap = BinaryHeap<Reverse<(DateTime<Utc>, String)>>;

/// Cron layer: keeps recurring definitions and enqueues a job each time one
/// comes due.
///
/// The database row is the source of truth for `next_run_at`; the in-memory
/// min-heap only decides when to wake up. Heap entries that no longer match
/// the row (removed or re-registered definitions) are skipped when popped.
pub struct Scheduler {
    conn: SharedConn,
    registry: Arc<QueueRegistry>,
    clock: Arc<dyn Clock>,
    heap: Mutex<DueHeap>,
    wake: Notify,
}

impl Scheduler {
    /// Create the scheduler on `conn`, initialising the schema if needed and
    /// loading every persisted definition.
    pub fn new(conn: SharedConn, registry: Arc<QueueRegistry>) -> Result<Self> {
        let clock = Arc::clone(registry.clock());
        let heap = {
            let c = conn.lock();
            init_db(&c)?;
            load_heap(&c)?
        };
        debug!(definitions = heap.len(), "scheduler loaded");
        Ok(Self { conn, registry, clock, heap: Mutex::new(heap), wake: Notify::new() })
    }

    /// Register a new definition. Its first run is the first cron match
    /// after now.
    pub fn register(&self, new: NewSchedule) -> Result<ScheduledJobDefinition> {
        let (spec, now) = self.validate(&new)?;
        let next = spec.next_after(now).ok_or_else(|| never_fires(&new.cron))?;
        let rand = Uuid::new_v4().simple().to_string();
        let def = ScheduledJobDefinition {
            id: format!("schedule_{}_{}", now.timestamp_millis(), &rand[..12]),
            name: new.name,
            cron: new.cron,
            timezone: new.timezone,
            queue: new.queue,
            job_name: new.job_name,
            payload: new.payload,
            options: new.options,
            next_run_at: Some(next),
            last_run_at: None,
            run_count: 0,
            created_at: now,
        };

        let res = self.conn.lock().execute(
            &format!("INSERT INTO schedules ({COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,0,?10)"),
            params![
                def.id,
                def.name,
                def.cron,
                def.timezone,
                def.queue,
                def.job_name,
                serde_json::to_string(&def.payload)?,
                serde_json::to_string(&def.options)?,
                next.timestamp_millis(),
                now.timestamp_millis(),
            ],
        );
        match res {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(SchedulerError::DuplicateSchedule { name: def.name });
            }
            Err(e) => return Err(e.into()),
        }

        info!(schedule_id = %def.id, name = %def.name, cron = %def.cron, next_run = %next, "schedule registered");
        self.push(next, def.id.clone());
        Ok(def)
    }

    /// Register `new` unless a definition with the same name exists.
    ///
    /// An identical existing definition is kept as is, so its persisted
    /// `next_run_at` survives restarts. A changed one is rewritten and its
    /// next run recomputed from now.
    pub fn ensure(&self, new: NewSchedule) -> Result<ScheduledJobDefinition> {
        let Some(existing) = self.get_by_name(&new.name)? else {
            return self.register(new);
        };
        let unchanged = existing.cron == new.cron
            && existing.timezone == new.timezone
            && existing.queue == new.queue
            && existing.job_name == new.job_name
            && existing.payload == new.payload
            && existing.options == new.options;
        if unchanged {
            return Ok(existing);
        }

        let (spec, now) = self.validate(&new)?;
        let next = spec.next_after(now).ok_or_else(|| never_fires(&new.cron))?;
        self.conn.lock().execute(
            "UPDATE schedules SET cron = ?2, timezone = ?3, queue = ?4, job_name = ?5,
                    payload = ?6, options = ?7, next_run_at = ?8
             WHERE id = ?1",
            params![
                existing.id,
                new.cron,
                new.timezone,
                new.queue,
                new.job_name,
                serde_json::to_string(&new.payload)?,
                serde_json::to_string(&new.options)?,
                next.timestamp_millis(),
            ],
        )?;
        info!(schedule_id = %existing.id, name = %new.name, "schedule updated");
        self.push(next, existing.id.clone());
        self.get(&existing.id)
    }

    fn validate(&self, new: &NewSchedule) -> Result<(CronSpec, DateTime<Utc>)> {
        if new.name.trim().is_empty() {
            return Err(SchedulerError::InvalidSchedule("schedule name must not be empty".into()));
        }
        if new.job_name.trim().is_empty() {
            return Err(SchedulerError::InvalidSchedule("job name must not be empty".into()));
        }
        self.registry.queue_config(&new.queue)?;
        let spec = CronSpec::parse(&new.cron, &new.timezone)?;
        Ok((spec, self.clock.now()))
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let n = self.conn.lock().execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!(schedule_id = %id, "schedule removed");
        Ok(())
    }

    /// All definitions, oldest first.
    pub fn list(&self) -> Result<Vec<ScheduledJobDefinition>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM schedules ORDER BY created_at, name"))?;
        let rows = stmt.query_map([], row_to_definition)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(&self, id: &str) -> Result<ScheduledJobDefinition> {
        self.find("id", id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<ScheduledJobDefinition>> {
        self.find("name", name)
    }

    fn find(&self, column: &str, value: &str) -> Result<Option<ScheduledJobDefinition>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM schedules WHERE {column} = ?1"),
                [value],
                row_to_definition,
            )
            .optional()?)
    }

    /// Earliest wake-up time currently known.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().peek().map(|Reverse((at, _))| *at)
    }

    fn push(&self, at: DateTime<Utc>, id: String) {
        self.heap.lock().push(Reverse((at, id)));
        self.wake.notify_one();
    }

    /// Fire every definition that is due now. Returns the number of jobs
    /// enqueued.
    ///
    /// However many occurrences were missed, a due definition fires once and
    /// its next run is the first match after now.
    pub fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut fired = 0;
        loop {
            let entry = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(Reverse((at, _))) if *at <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(Reverse((_, id))) = entry else { break };
            match self.fire(&id, now) {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(schedule_id = %id, "schedule tick failed: {e}");
                    self.heap
                        .lock()
                        .push(Reverse((now + chrono::Duration::seconds(RETRY_AFTER_ERROR_SECS), id)));
                }
            }
        }
        Ok(fired)
    }

    /// Advance one definition's cursor, then enqueue its job.
    ///
    /// The cursor is persisted first: if the process dies in between, the
    /// tick is lost rather than repeated.
    fn fire(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(def) = self.find("id", id)? else {
            return Ok(false);
        };
        let Some(due_at) = def.next_run_at.filter(|at| *at <= now) else {
            return Ok(false);
        };

        let spec = CronSpec::parse(&def.cron, &def.timezone)?;
        let next = spec.next_after(now);
        let run = def.run_count + 1;
        let advanced = self.conn.lock().execute(
            "UPDATE schedules SET next_run_at = ?2, last_run_at = ?3, run_count = ?4
             WHERE id = ?1 AND next_run_at = ?5",
            params![
                def.id,
                next.map(|n| n.timestamp_millis()),
                now.timestamp_millis(),
                run as i64,
                due_at.timestamp_millis(),
            ],
        )?;
        if advanced == 0 {
            return Ok(false);
        }
        match next {
            Some(next) => self.heap.lock().push(Reverse((next, def.id.clone()))),
            None => warn!(schedule_id = %def.id, cron = %def.cron, "schedule has no future runs"),
        }

        let payload = materialize(
            &def.payload,
            &TickContext { schedule_id: &def.id, schedule_name: &def.name, scheduled_at: due_at, run },
        );
        let opts: JobOptions = def.options.clone();
        match self.registry.enqueue(&def.queue, &def.job_name, payload, opts) {
            Ok(handle) => {
                info!(
                    schedule_id = %def.id,
                    name = %def.name,
                    job_id = %handle.id,
                    queue = %def.queue,
                    run,
                    "scheduled job enqueued"
                );
                self.registry.bus().publish(JobEvent::Scheduled {
                    schedule_id: def.id.clone(),
                    queue: def.queue.clone(),
                    job_name: def.job_name.clone(),
                    cron: def.cron.clone(),
                });
                Ok(true)
            }
            Err(e) => {
                error!(schedule_id = %def.id, kind = e.kind(), "scheduled job rejected: {e}");
                Ok(false)
            }
        }
    }

    /// Timer loop: sleep until the earliest due definition, fire, repeat,
    /// until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(definitions = self.heap.lock().len(), "scheduler started");
        loop {
            match self.tick() {
                Ok(0) => {}
                Ok(n) => debug!(fired = n, "scheduler tick"),
                Err(e) => error!("scheduler tick error: {e}"),
            }

            let wait = self
                .next_due()
                .map(|at| (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
                .map_or(MAX_IDLE, |d| d.min(MAX_IDLE));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn never_fires(cron: &str) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("cron expression '{cron}' never fires"))
}

fn load_heap(conn: &Connection) -> Result<DueHeap> {
    let mut stmt =
        conn.prepare("SELECT next_run_at, id FROM schedules WHERE next_run_at IS NOT NULL")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
    let mut heap = BinaryHeap::new();
    for row in rows {
        let (at, id) = row?;
        heap.push(Reverse((from_ms(at), id)));
    }
    Ok(heap)
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_definition(row: &Row<'_>) -> rusqlite::Result<ScheduledJobDefinition> {
    Ok(ScheduledJobDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        timezone: row.get(3)?,
        queue: row.get(4)?,
        job_name: row.get(5)?,
        payload: json_col(row, 6)?,
        options: json_col(row, 7)?,
        next_run_at: row.get::<_, Option<i64>>(8)?.map(from_ms),
        last_run_at: row.get::<_, Option<i64>>(9)?.map(from_ms),
        run_count: row.get::<_, i64>(10)? as u64,
        created_at: from_ms(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobq_core::{JobStatus, ManualClock, QueueConfig};
    use jobq_events::EventBus;
    use jobq_queue::{JobStore, Page};
    use serde_json::json;

    struct Fixture {
        clock: Arc<ManualClock>,
        conn: SharedConn,
        registry: Arc<QueueRegistry>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let conn = jobq_queue::db::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new(clock.clone()));
        let store = Arc::new(JobStore::new(conn.clone()));
        let registry = Arc::new(QueueRegistry::new(store, bus, clock.clone(), 64 * 1024));
        registry.create_queue(QueueConfig::new("normal", 3, 5)).unwrap();
        let scheduler = Scheduler::new(conn.clone(), registry.clone()).unwrap();
        Fixture { clock, conn, registry, scheduler }
    }

    fn waiting(f: &Fixture) -> u64 {
        f.registry.queue_status("normal").unwrap().waiting
    }

    #[test]
    fn five_minute_cron_fires_exactly_once_after_five_minutes() {
        let f = fixture();
        f.scheduler.register(NewSchedule::new("sync", "*/5 * * * *", "normal", "sync")).unwrap();

        assert_eq!(f.scheduler.tick().unwrap(), 0);
        f.clock.advance(chrono::Duration::minutes(5));
        assert_eq!(f.scheduler.tick().unwrap(), 1);
        assert_eq!(f.scheduler.tick().unwrap(), 0);
        assert_eq!(waiting(&f), 1);
    }

    #[test]
    fn restart_does_not_refire_a_tick() {
        let f = fixture();
        f.scheduler.register(NewSchedule::new("sync", "*/5 * * * *", "normal", "sync")).unwrap();
        f.clock.advance(chrono::Duration::minutes(5));
        assert_eq!(f.scheduler.tick().unwrap(), 1);

        let restarted = Scheduler::new(f.conn.clone(), f.registry.clone()).unwrap();
        assert_eq!(restarted.tick().unwrap(), 0);
        assert_eq!(waiting(&f), 1);

        f.clock.advance(chrono::Duration::minutes(5));
        assert_eq!(restarted.tick().unwrap(), 1);
        assert_eq!(waiting(&f), 2);
    }

    #[test]
    fn missed_ticks_coalesce_into_one_run() {
        let f = fixture();
        let def = f
            .scheduler
            .register(NewSchedule::new("sync", "*/5 * * * *", "normal", "sync"))
            .unwrap();

        f.clock.advance(chrono::Duration::minutes(62));
        assert_eq!(f.scheduler.tick().unwrap(), 1);
        assert_eq!(waiting(&f), 1);

        let def = f.scheduler.get(&def.id).unwrap();
        assert_eq!(def.run_count, 1);
        assert_eq!(def.next_run_at, Some(Utc.with_ymd_and_hms(2026, 1, 1, 1, 5, 0).unwrap()));
    }

    #[test]
    fn payload_template_is_materialized() {
        let f = fixture();
        let new = NewSchedule::new("report", "0 * * * *", "normal", "generate_report")
            .with_payload(json!({ "reportType": "hourly", "source": "{{schedule_name}}" }))
            .with_options(JobOptions::default().with_priority(7));
        f.scheduler.register(new).unwrap();
        f.clock.advance(chrono::Duration::hours(1));
        f.scheduler.tick().unwrap();

        let jobs = f.registry.list_jobs("normal", JobStatus::Waiting, Page::default()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "generate_report");
        assert_eq!(jobs[0].priority, 7);
        assert_eq!(jobs[0].payload, json!({ "reportType": "hourly", "source": "report" }));
    }

    #[test]
    fn registration_is_validated() {
        let f = fixture();
        f.scheduler.register(NewSchedule::new("a", "0 * * * *", "normal", "x")).unwrap();
        assert!(matches!(
            f.scheduler.register(NewSchedule::new("a", "0 * * * *", "normal", "x")),
            Err(SchedulerError::DuplicateSchedule { .. })
        ));
        assert!(matches!(
            f.scheduler.register(NewSchedule::new("b", "0 * * * *", "missing", "x")),
            Err(SchedulerError::Queue(_))
        ));
        assert!(matches!(
            f.scheduler.register(NewSchedule::new("c", "not cron", "normal", "x")),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn ensure_keeps_cursor_of_unchanged_definition() {
        let f = fixture();
        let first = f.scheduler.ensure(NewSchedule::new("a", "*/5 * * * *", "normal", "x")).unwrap();
        f.clock.advance(chrono::Duration::minutes(3));

        let again = f.scheduler.ensure(NewSchedule::new("a", "*/5 * * * *", "normal", "x")).unwrap();
        assert_eq!(again.next_run_at, first.next_run_at);

        let changed = f.scheduler.ensure(NewSchedule::new("a", "0 * * * *", "normal", "x")).unwrap();
        assert_eq!(changed.id, first.id);
        assert_eq!(changed.next_run_at, Some(Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap()));
        assert_eq!(f.scheduler.list().unwrap().len(), 1);

        // The stale five-minute heap entry must not fire the updated definition.
        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(f.scheduler.tick().unwrap(), 0);
    }

    #[test]
    fn removed_definition_never_fires() {
        let f = fixture();
        let def = f.scheduler.register(NewSchedule::new("a", "*/5 * * * *", "normal", "x")).unwrap();
        f.scheduler.remove(&def.id).unwrap();
        f.clock.advance(chrono::Duration::minutes(5));
        assert_eq!(f.scheduler.tick().unwrap(), 0);
        assert!(matches!(
            f.scheduler.remove(&def.id),
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let f = fixture();
        let scheduler = Arc::new(f.scheduler);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
