use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::Result;

/// One SQLite connection shared by the job store and the dead-letter store,
/// so a terminal failure and its dead-letter record commit together.
pub type SharedConn = Arc<Mutex<Connection>>;

/// Open (or create) the database file and apply the schema.
pub fn open(path: &str) -> Result<SharedConn> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Private in-memory database, used by tests and `jobq run --in-memory`.
pub fn open_in_memory() -> Result<SharedConn> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Initialise the job and dead-letter schema in `conn`. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            seq           INTEGER PRIMARY KEY AUTOINCREMENT,  -- FIFO tie-break
            id            TEXT    NOT NULL,
            queue         TEXT    NOT NULL,
            name          TEXT    NOT NULL,
            payload       TEXT    NOT NULL,   -- opaque JSON
            priority      INTEGER NOT NULL,
            status        TEXT    NOT NULL,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            max_attempts  INTEGER NOT NULL,
            backoff       TEXT    NOT NULL,   -- JSON BackoffPolicy
            timeout_ms    INTEGER,
            delay_until   INTEGER,            -- unix ms, delayed jobs only
            created_at    INTEGER NOT NULL,
            processed_at  INTEGER,
            completed_at  INTEGER,
            progress      INTEGER NOT NULL DEFAULT 0,
            failed_reason TEXT,
            result        TEXT,
            lease_token   TEXT,               -- set while active
            lease_until   INTEGER,
            stall_count   INTEGER NOT NULL DEFAULT 0,
            UNIQUE (queue, id)
        ) STRICT;

        -- Claim query: WHERE queue = ? AND status IN (...) ORDER BY priority, created_at, seq
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs (queue, status, priority, created_at, seq);
        -- Stall reaper: WHERE status = 'active' AND lease_until < ?
        CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs (status, lease_until);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id            TEXT    NOT NULL PRIMARY KEY,
            queue         TEXT    NOT NULL,
            job_id        TEXT    NOT NULL,
            job_name      TEXT    NOT NULL,
            payload       TEXT    NOT NULL,
            error         TEXT    NOT NULL,
            attempts_made INTEGER NOT NULL,
            max_attempts  INTEGER NOT NULL,
            failed_at     INTEGER NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters (failed_at);
        -- A manually retried job that fails again gets a second record.
        CREATE INDEX IF NOT EXISTS idx_dead_letters_job ON dead_letters (queue, job_id);
        ",
    )?;
    Ok(())
}

pub(crate) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
