//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session_lock (
    session_id      TEXT PRIMARY KEY NOT NULL,
    owner_pid       INTEGER NOT NULL,
    heartbeat_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox_action (
    id              TEXT PRIMARY KEY NOT NULL,
    cmd             TEXT NOT NULL,
    args            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    position        INTEGER NOT NULL,
    state           TEXT NOT NULL CHECK(state IN ('queued','failed')),
    last_error      TEXT,
    failure_kind    TEXT CHECK(failure_kind IS NULL OR failure_kind IN ('transient','terminal')),
    failed_at       TEXT
);

CREATE TABLE IF NOT EXISTS task (
    id                  TEXT PRIMARY KEY NOT NULL,
    title               TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('pending','in_progress','completed')),
    assignee_session_id TEXT,
    assignee_agent      TEXT,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recovery_log (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id       TEXT NOT NULL,
    success          INTEGER NOT NULL,
    message          TEXT NOT NULL,
    tasks_unassigned INTEGER NOT NULL,
    recovered_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_state_position ON outbox_action(state, position);
CREATE INDEX IF NOT EXISTS idx_task_assignee ON task(assignee_session_id);
CREATE INDEX IF NOT EXISTS idx_recovery_log_session ON recovery_log(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
