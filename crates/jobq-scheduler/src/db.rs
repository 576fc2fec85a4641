use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`. Idempotent.
///
/// `next_run_at` is the durable cursor: it is advanced before a tick's job
/// is enqueued, so a restart never fires the same tick twice.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id           TEXT    NOT NULL PRIMARY KEY,
            name         TEXT    NOT NULL UNIQUE,
            cron         TEXT    NOT NULL,
            timezone     TEXT    NOT NULL DEFAULT 'UTC',
            queue        TEXT    NOT NULL,
            job_name     TEXT    NOT NULL,
            payload      TEXT    NOT NULL,   -- JSON template
            options      TEXT    NOT NULL,   -- JSON JobOptions
            next_run_at  INTEGER,            -- unix ms; NULL once the expression has no future match
            last_run_at  INTEGER,
            run_count    INTEGER NOT NULL DEFAULT 0,
            created_at   INTEGER NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules (next_run_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }
}
