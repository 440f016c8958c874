//! SQLite-backed [`RunStore`].
//!
//! Blocking `rusqlite` calls run on the blocking pool via
//! `tokio::task::spawn_blocking`, so a slow write never stalls the runtime
//! threads that drive other runs.

use super::RunStore;
use super::types::{
    ActionItem, Insight, JobSettings, LeadRecord, LeadSummary, NewAction, NewInsight, NewLead,
    NewRun, NewSource, RunStatus, SourceItem, StepRecord, StepStatus, WorkflowRun,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id            TEXT PRIMARY KEY,
    job_id        TEXT NOT NULL,
    status        TEXT NOT NULL,
    progress      INTEGER NOT NULL DEFAULT 0,
    error         TEXT,
    current_step  TEXT,
    summary       TEXT,
    payload       TEXT NOT NULL,
    retry_options TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    completed_at  TEXT,
    owner         TEXT,
    heartbeat_at  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active_per_job
    ON runs(job_id) WHERE status IN ('PENDING', 'IN_PROGRESS');
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

CREATE TABLE IF NOT EXISTS steps (
    run_id       TEXT NOT NULL REFERENCES runs(id),
    name         TEXT NOT NULL,
    status       TEXT NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    result       TEXT,
    error        TEXT,
    seq          INTEGER NOT NULL,
    started_at   TEXT NOT NULL,
    completed_at TEXT,
    PRIMARY KEY (run_id, name)
);

CREATE TABLE IF NOT EXISTS sources (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT NOT NULL REFERENCES runs(id),
    url        TEXT NOT NULL,
    title      TEXT NOT NULL,
    content    TEXT NOT NULL,
    provider   TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, url)
);

CREATE TABLE IF NOT EXISTS insights (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(id),
    title       TEXT NOT NULL,
    detail      TEXT NOT NULL,
    category    TEXT,
    source_urls TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE (run_id, title)
);

CREATE TABLE IF NOT EXISTS actions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES runs(id),
    title       TEXT NOT NULL,
    description TEXT NOT NULL,
    priority    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE (run_id, title)
);

CREATE TABLE IF NOT EXISTS leads (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL REFERENCES runs(id),
    job_id       TEXT NOT NULL,
    company      TEXT NOT NULL,
    contact_role TEXT,
    website      TEXT,
    rationale    TEXT NOT NULL,
    score        REAL,
    created_at   TEXT NOT NULL,
    UNIQUE (run_id, company)
);
CREATE INDEX IF NOT EXISTS idx_leads_job ON leads(job_id);

CREATE TABLE IF NOT EXISTS lead_summaries (
    job_id           TEXT PRIMARY KEY,
    total_leads      INTEGER NOT NULL,
    generation_count INTEGER NOT NULL,
    last_run_id      TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_settings (
    job_id             TEXT PRIMARY KEY,
    inference_provider TEXT,
    inference_model    TEXT,
    max_sources        INTEGER,
    updated_at         TEXT NOT NULL
);
"#;

const RUN_COLUMNS: &str = "id, job_id, status, progress, error, current_step, summary, \
     payload, retry_options, created_at, updated_at, completed_at, owner, heartbeat_at";

const STEP_COLUMNS: &str =
    "run_id, name, status, attempts, result, error, seq, started_at, completed_at";

const ACTIVE_STATUSES: &str = "('PENDING', 'IN_PROGRESS')";

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        RunStatus::parse(text).ok_or_else(|| {
            FromSqlError::Other(Box::new(StoreError::InvalidValue {
                column: "status".into(),
                value: text.to_string(),
            }))
        })
    }
}

impl ToSql for StepStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for StepStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        StepStatus::parse(text).ok_or_else(|| {
            FromSqlError::Other(Box::new(StoreError::InvalidValue {
                column: "status".into(),
                value: text.to_string(),
            }))
        })
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        serde_json::from_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: row.get(2)?,
        progress: row.get(3)?,
        error: row.get(4)?,
        current_step: row.get(5)?,
        summary: row.get(6)?,
        payload: json_column(row, 7)?,
        retry_options: json_column(row, 8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
        owner: row.get(12)?,
        heartbeat_at: row.get(13)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    Ok(StepRecord {
        run_id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        attempts: row.get(3)?,
        result: optional_json_column(row, 4)?,
        error: row.get(5)?,
        seq: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn fetch_run(conn: &Connection, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1");
    Ok(conn.query_row(&sql, params![run_id], run_from_row).optional()?)
}

fn fetch_step(conn: &Connection, run_id: &str, name: &str) -> Result<Option<StepRecord>, StoreError> {
    let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND name = ?2");
    Ok(conn
        .query_row(&sql, params![run_id, name], step_from_row)
        .optional()?)
}

fn active_run_id(
    conn: &Connection,
    job_id: &str,
    exclude_run_id: Option<&str>,
) -> Result<Option<String>, StoreError> {
    let sql = format!(
        "SELECT id FROM runs WHERE job_id = ?1 AND status IN {ACTIVE_STATUSES} \
         AND id != COALESCE(?2, '') LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![job_id, exclude_run_id], |r| r.get(0))
        .optional()?)
}

/// SQLite implementation of the record store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::InvalidValue {
                column: "path".into(),
                value: format!("{}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened run store");
        Self::init(conn)
    }

    /// An in-memory database, discarded on drop.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, run: NewRun) -> Result<WorkflowRun, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if let Some(active) = active_run_id(&tx, &run.job_id, None)? {
                return Err(StoreError::ActiveRunExists {
                    job_id: run.job_id,
                    run_id: active,
                });
            }
            let now = Utc::now();
            tx.execute(
                "INSERT INTO runs (id, job_id, status, progress, payload, retry_options, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6)",
                params![
                    run.id,
                    run.job_id,
                    RunStatus::Pending,
                    serde_json::to_string(&run.payload)?,
                    serde_json::to_string(&run.retry_options)?,
                    now,
                ],
            )?;
            let created = fetch_run(&tx, &run.id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run.id.clone(),
            })?;
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| fetch_run(conn, &run_id)).await
    }

    async fn active_run_for_job(&self, job_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |conn| match active_run_id(conn, &job_id, None)? {
            Some(id) => fetch_run(conn, &id),
            None => Ok(None),
        })
        .await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>, StoreError> {
        self.call(move |conn| {
            let sql = format!(
                "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], run_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn list_runs_with_status(
        &self,
        status: RunStatus,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        self.call(move |conn| {
            let sql = format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE status = ?1 ORDER BY created_at, rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status], run_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<WorkflowRun, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let current = fetch_run(&tx, &run_id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })?;
            if !status.is_terminal() {
                if let Some(active) = active_run_id(&tx, &current.job_id, Some(&run_id))? {
                    return Err(StoreError::ActiveRunExists {
                        job_id: current.job_id,
                        run_id: active,
                    });
                }
            }
            let now = Utc::now();
            let completed_at = status.is_terminal().then_some(now);
            let error = if status.is_terminal() { error } else { None };
            tx.execute(
                "UPDATE runs SET status = ?2, error = ?3, updated_at = ?4, completed_at = ?5
                 WHERE id = ?1",
                params![run_id, status, error, now, completed_at],
            )?;
            let updated = fetch_run(&tx, &run_id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    async fn claim_run(
        &self,
        run_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<WorkflowRun, StoreError> {
        let (run_id, owner) = (run_id.to_string(), owner.to_string());
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = fetch_run(&tx, &run_id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })?;
            let now = Utc::now();
            if let (Some(holder), Some(beat)) = (current.owner, current.heartbeat_at) {
                let age = (now - beat).to_std().unwrap_or_default();
                if holder != owner && age < lease {
                    return Err(StoreError::RunLeased {
                        run_id,
                        owner: holder,
                    });
                }
            }
            if let Some(active) = active_run_id(&tx, &current.job_id, Some(&run_id))? {
                return Err(StoreError::ActiveRunExists {
                    job_id: current.job_id,
                    run_id: active,
                });
            }
            tx.execute(
                "UPDATE runs SET status = ?2, error = NULL, completed_at = NULL,
                     owner = ?3, heartbeat_at = ?4, updated_at = ?4
                 WHERE id = ?1",
                params![run_id, RunStatus::InProgress, owner, now],
            )?;
            let claimed = fetch_run(&tx, &run_id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })?;
            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn renew_lease(&self, run_id: &str, owner: &str) -> Result<bool, StoreError> {
        let (run_id, owner) = (run_id.to_string(), owner.to_string());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET heartbeat_at = ?3 WHERE id = ?1 AND owner = ?2",
                params![run_id, owner, Utc::now()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn release_run(
        &self,
        run_id: &str,
        owner: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<WorkflowRun, StoreError> {
        let (run_id, owner) = (run_id.to_string(), owner.to_string());
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = fetch_run(&tx, &run_id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })?;
            if current.owner.as_deref() != Some(owner.as_str()) {
                return Ok(current);
            }
            let now = Utc::now();
            if current.status.is_terminal() {
                tx.execute(
                    "UPDATE runs SET owner = NULL, heartbeat_at = NULL WHERE id = ?1",
                    params![run_id],
                )?;
            } else {
                let completed_at = status.is_terminal().then_some(now);
                let error = if status.is_terminal() { error } else { None };
                tx.execute(
                    "UPDATE runs SET status = ?2, error = ?3, updated_at = ?4, completed_at = ?5,
                         owner = NULL, heartbeat_at = NULL
                     WHERE id = ?1",
                    params![run_id, status, error, now, completed_at],
                )?;
            }
            let released = fetch_run(&tx, &run_id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })?;
            tx.commit()?;
            Ok(released)
        })
        .await
    }

    async fn set_retry_options(
        &self,
        run_id: &str,
        retry_options: Value,
    ) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE runs SET retry_options = ?2, updated_at = ?3 WHERE id = ?1",
                params![run_id, serde_json::to_string(&retry_options)?, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_current_step(&self, run_id: &str, step: &str) -> Result<(), StoreError> {
        let (run_id, step) = (run_id.to_string(), step.to_string());
        self.call(move |conn| {
            conn.execute(
                "UPDATE runs SET current_step = ?2, updated_at = ?3 WHERE id = ?1",
                params![run_id, step, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_run_summary(&self, run_id: &str, summary: &str) -> Result<(), StoreError> {
        let (run_id, summary) = (run_id.to_string(), summary.to_string());
        self.call(move |conn| {
            conn.execute(
                "UPDATE runs SET summary = ?2, updated_at = ?3 WHERE id = ?1",
                params![run_id, summary, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn advance_progress(&self, run_id: &str, value: u8) -> Result<u8, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET progress = MAX(progress, MIN(?2, 100)), updated_at = ?3
                 WHERE id = ?1",
                params![run_id, value, Utc::now()],
            )?;
            if changed == 0 {
                return Err(StoreError::RunNotFound { run_id });
            }
            Ok(conn.query_row(
                "SELECT progress FROM runs WHERE id = ?1",
                params![run_id],
                |r| r.get(0),
            )?)
        })
        .await
    }

    async fn get_step(&self, run_id: &str, name: &str) -> Result<Option<StepRecord>, StoreError> {
        let (run_id, name) = (run_id.to_string(), name.to_string());
        self.call(move |conn| fetch_step(conn, &run_id, &name)).await
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY seq");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![run_id], step_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn begin_step(&self, run_id: &str, name: &str) -> Result<StepRecord, StoreError> {
        let (run_id, name) = (run_id.to_string(), name.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO steps (run_id, name, status, attempts, seq, started_at)
                 VALUES (?1, ?2, ?3, 1,
                         (SELECT COALESCE(MAX(seq), 0) + 1 FROM steps WHERE run_id = ?1), ?4)
                 ON CONFLICT (run_id, name) DO UPDATE SET
                     status = excluded.status,
                     attempts = steps.attempts + 1,
                     error = NULL,
                     started_at = excluded.started_at,
                     completed_at = NULL
                 WHERE steps.status != 'DONE'",
                params![run_id, name, StepStatus::Running, Utc::now()],
            )?;
            fetch_step(conn, &run_id, &name)?.ok_or(StoreError::RunNotFound { run_id })
        })
        .await
    }

    async fn complete_step(
        &self,
        run_id: &str,
        name: &str,
        result: Value,
    ) -> Result<StepRecord, StoreError> {
        let (run_id, name) = (run_id.to_string(), name.to_string());
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE steps SET status = ?3, result = ?4, error = NULL, completed_at = ?5
                 WHERE run_id = ?1 AND name = ?2 AND status != 'DONE'",
                params![
                    run_id,
                    name,
                    StepStatus::Done,
                    serde_json::to_string(&result)?,
                    Utc::now()
                ],
            )?;
            let stored = fetch_step(&tx, &run_id, &name)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.clone(),
            })?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn fail_step(&self, run_id: &str, name: &str, error: &str) -> Result<(), StoreError> {
        let (run_id, name, error) = (run_id.to_string(), name.to_string(), error.to_string());
        self.call(move |conn| {
            conn.execute(
                "UPDATE steps SET status = ?3, error = ?4, completed_at = ?5
                 WHERE run_id = ?1 AND name = ?2 AND status != 'DONE'",
                params![run_id, name, StepStatus::Failed, error, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_sources(
        &self,
        run_id: &str,
        sources: Vec<NewSource>,
    ) -> Result<usize, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO sources (run_id, url, title, content, provider, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for s in &sources {
                    inserted += stmt.execute(params![run_id, s.url, s.title, s.content, s.provider, now])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn list_sources(&self, run_id: &str) -> Result<Vec<SourceItem>, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, url, title, content, provider, created_at
                 FROM sources WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok(SourceItem {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    url: row.get(2)?,
                    title: row.get(3)?,
                    content: row.get(4)?,
                    provider: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn count_sources(&self, run_id: &str) -> Result<usize, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sources WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn latest_run_with_sources(
        &self,
        job_id: &str,
        exclude_run_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let (job_id, exclude) = (job_id.to_string(), exclude_run_id.to_string());
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT r.id FROM runs r
                     WHERE r.job_id = ?1 AND r.id != ?2
                       AND EXISTS (SELECT 1 FROM sources s WHERE s.run_id = r.id)
                     ORDER BY r.created_at DESC, r.rowid DESC LIMIT 1",
                    params![job_id, exclude],
                    |r| r.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn copy_sources(&self, from_run_id: &str, to_run_id: &str) -> Result<usize, StoreError> {
        let (from, to) = (from_run_id.to_string(), to_run_id.to_string());
        self.call(move |conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO sources (run_id, url, title, content, provider, created_at)
                 SELECT ?2, url, title, content, provider, ?3 FROM sources
                 WHERE run_id = ?1 ORDER BY id",
                params![from, to, Utc::now()],
            )?)
        })
        .await
    }

    async fn insert_insights(
        &self,
        run_id: &str,
        insights: Vec<NewInsight>,
    ) -> Result<usize, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO insights (run_id, title, detail, category, source_urls, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for i in &insights {
                    inserted += stmt.execute(params![
                        run_id,
                        i.title,
                        i.detail,
                        i.category,
                        serde_json::to_string(&i.source_urls)?,
                        now
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn list_insights(&self, run_id: &str) -> Result<Vec<Insight>, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, title, detail, category, source_urls, created_at
                 FROM insights WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                let urls = json_column(row, 5)?;
                Ok(Insight {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    title: row.get(2)?,
                    detail: row.get(3)?,
                    category: row.get(4)?,
                    source_urls: serde_json::from_value(urls).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                    })?,
                    created_at: row.get(6)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn insert_actions(
        &self,
        run_id: &str,
        actions: Vec<NewAction>,
    ) -> Result<usize, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO actions (run_id, title, description, priority, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for a in &actions {
                    inserted += stmt.execute(params![run_id, a.title, a.description, a.priority, now])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn list_actions(&self, run_id: &str) -> Result<Vec<ActionItem>, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, title, description, priority, created_at
                 FROM actions WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok(ActionItem {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    priority: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn insert_leads(
        &self,
        run_id: &str,
        job_id: &str,
        leads: Vec<NewLead>,
    ) -> Result<usize, StoreError> {
        let (run_id, job_id) = (run_id.to_string(), job_id.to_string());
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO leads
                         (run_id, job_id, company, contact_role, website, rationale, score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for l in &leads {
                    inserted += stmt.execute(params![
                        run_id,
                        job_id,
                        l.company,
                        l.contact_role,
                        l.website,
                        l.rationale,
                        l.score,
                        now
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn list_leads(&self, run_id: &str) -> Result<Vec<LeadRecord>, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, job_id, company, contact_role, website, rationale, score, created_at
                 FROM leads WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok(LeadRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    job_id: row.get(2)?,
                    company: row.get(3)?,
                    contact_role: row.get(4)?,
                    website: row.get(5)?,
                    rationale: row.get(6)?,
                    score: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn upsert_lead_summary(
        &self,
        job_id: &str,
        run_id: &str,
    ) -> Result<LeadSummary, StoreError> {
        let (job_id, run_id) = (job_id.to_string(), run_id.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO lead_summaries (job_id, total_leads, generation_count, last_run_id, updated_at)
                 VALUES (?1, (SELECT COUNT(*) FROM leads WHERE job_id = ?1), 1, ?2, ?3)
                 ON CONFLICT (job_id) DO UPDATE SET
                     total_leads = excluded.total_leads,
                     generation_count = lead_summaries.generation_count
                         + CASE WHEN lead_summaries.last_run_id = excluded.last_run_id THEN 0 ELSE 1 END,
                     last_run_id = excluded.last_run_id,
                     updated_at = excluded.updated_at",
                params![job_id, run_id, Utc::now()],
            )?;
            fetch_lead_summary(conn, &job_id)?.ok_or(StoreError::InvalidValue {
                column: "lead_summaries.job_id".into(),
                value: job_id,
            })
        })
        .await
    }

    async fn get_lead_summary(&self, job_id: &str) -> Result<Option<LeadSummary>, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |conn| fetch_lead_summary(conn, &job_id)).await
    }

    async fn get_job_settings(&self, job_id: &str) -> Result<Option<JobSettings>, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT job_id, inference_provider, inference_model, max_sources
                     FROM job_settings WHERE job_id = ?1",
                    params![job_id],
                    |row| {
                        let max_sources: Option<i64> = row.get(3)?;
                        Ok(JobSettings {
                            job_id: row.get(0)?,
                            inference_provider: row.get(1)?,
                            inference_model: row.get(2)?,
                            max_sources: max_sources.map(|n| n.max(0) as usize),
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn put_job_settings(&self, settings: JobSettings) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO job_settings (job_id, inference_provider, inference_model, max_sources, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (job_id) DO UPDATE SET
                     inference_provider = excluded.inference_provider,
                     inference_model = excluded.inference_model,
                     max_sources = excluded.max_sources,
                     updated_at = excluded.updated_at",
                params![
                    settings.job_id,
                    settings.inference_provider,
                    settings.inference_model,
                    settings.max_sources.map(|n| n as i64),
                    Utc::now()
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn fetch_lead_summary(conn: &Connection, job_id: &str) -> Result<Option<LeadSummary>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT job_id, total_leads, generation_count, last_run_id, updated_at
             FROM lead_summaries WHERE job_id = ?1",
            params![job_id],
            |row| {
                let total: i64 = row.get(1)?;
                Ok(LeadSummary {
                    job_id: row.get(0)?,
                    total_leads: total.max(0) as u64,
                    generation_count: row.get(2)?,
                    last_run_id: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()?)
}
