use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. Every closure passed to [`DbHandle::call`]
/// runs with exclusive access to the connection.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FactoryDb {
    conn: Connection,
}

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS game_specs (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    brief TEXT NOT NULL,
                    spec_markdown TEXT NOT NULL,
                    spec_json TEXT NOT NULL,
                    spec_hash TEXT NOT NULL UNIQUE,
                    genre TEXT,
                    duration_sec INTEGER,
                    state TEXT NOT NULL DEFAULT 'creating',
                    devin_session_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS spec_jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    brief TEXT NOT NULL,
                    constraints TEXT,
                    result_spec_id TEXT REFERENCES game_specs(id) ON DELETE SET NULL,
                    duplicate_of TEXT NOT NULL DEFAULT '[]',
                    duplicate_list TEXT NOT NULL DEFAULT '[]',
                    score_similarity REAL,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    started_at TEXT,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS code_jobs (
                    id TEXT PRIMARY KEY,
                    game_spec_id TEXT REFERENCES game_specs(id) ON DELETE CASCADE,
                    game_spec TEXT NOT NULL,
                    output_path TEXT,
                    status TEXT NOT NULL DEFAULT 'queued',
                    progress INTEGER NOT NULL DEFAULT 0,
                    artifact_url TEXT,
                    error TEXT,
                    logs TEXT NOT NULL DEFAULT '[]',
                    started_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS spec_state_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    game_spec_id TEXT NOT NULL REFERENCES game_specs(id) ON DELETE CASCADE,
                    state_before TEXT,
                    state_after TEXT NOT NULL,
                    detail TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE INDEX IF NOT EXISTS idx_spec_jobs_result ON spec_jobs(result_spec_id);
                CREATE INDEX IF NOT EXISTS idx_code_jobs_spec ON code_jobs(game_spec_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_code_jobs_status ON code_jobs(status, updated_at);
                CREATE INDEX IF NOT EXISTS idx_state_logs_spec ON spec_state_logs(game_spec_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Game specs ────────────────────────────────────────────────────

    /// Insert a spec together with its first audit record (`null → creating`).
    ///
    /// Returns `Ok(None)` when another spec already carries the same
    /// `spec_hash`; nothing is written in that case.
    pub fn insert_game_spec(&self, spec: &NewGameSpec) -> Result<Option<GameSpec>> {
        let spec_json =
            serde_json::to_string(&spec.spec_json).context("Failed to serialize spec_json")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let inserted = tx.execute(
            "INSERT INTO game_specs (id, title, brief, spec_markdown, spec_json, spec_hash, genre, duration_sec, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                spec.id,
                spec.title,
                spec.brief,
                spec.spec_markdown,
                spec_json,
                spec.spec_hash,
                spec.genre(),
                spec.duration_sec(),
                SpecState::Creating.as_str(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to insert game spec"),
        }

        tx.execute(
            "INSERT INTO spec_state_logs (game_spec_id, state_before, state_after, detail)
             VALUES (?1, NULL, ?2, 'Game spec created')",
            params![spec.id, SpecState::Creating.as_str()],
        )
        .context("Failed to insert initial state record")?;

        tx.commit().context("Failed to commit game spec insert")?;
        self.get_game_spec(&spec.id)
    }

    pub fn get_game_spec(&self, id: &str) -> Result<Option<GameSpec>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, brief, spec_markdown, spec_json, spec_hash, genre, duration_sec, state, devin_session_id, created_at
                 FROM game_specs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(GameSpecRow {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        brief: row.get(2)?,
                        spec_markdown: row.get(3)?,
                        spec_json: row.get(4)?,
                        spec_hash: row.get(5)?,
                        genre: row.get(6)?,
                        duration_sec: row.get(7)?,
                        state: row.get(8)?,
                        devin_session_id: row.get(9)?,
                        created_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .context("Failed to query game spec")?;
        row.map(GameSpecRow::into_game_spec).transpose()
    }

    /// Newest first.
    pub fn list_game_specs(&self, limit: i64) -> Result<Vec<GameSpecSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, brief, state, created_at FROM game_specs
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )
            .context("Failed to prepare list_game_specs")?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query game specs")?;

        let mut specs = Vec::new();
        for row in rows {
            let (id, title, brief, state, created_at) =
                row.context("Failed to read game spec row")?;
            specs.push(GameSpecSummary {
                id,
                title,
                brief,
                state: parse_state(&state)?,
                created_at,
            });
        }
        Ok(specs)
    }

    pub fn get_spec_state(&self, id: &str) -> Result<Option<SpecState>> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM game_specs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query spec state")?;
        state.as_deref().map(parse_state).transpose()
    }

    pub fn set_devin_session_id(&self, id: &str, session_id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE game_specs SET devin_session_id = ?1 WHERE id = ?2",
                params![session_id, id],
            )
            .context("Failed to store agent session id")?;
        Ok(count > 0)
    }

    /// Delete a spec. Code jobs and state records cascade; spec jobs that
    /// produced it keep their row with `result_spec_id` cleared.
    pub fn delete_game_spec(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM game_specs WHERE id = ?1", params![id])
            .context("Failed to delete game spec")?;
        Ok(count > 0)
    }

    // ── State records ─────────────────────────────────────────────────

    /// Move a spec from `expected` to `next` and append the matching audit
    /// record, atomically. Returns `Ok(None)` when the spec is no longer in
    /// `expected` (or no longer exists).
    pub fn compare_and_set_state(
        &self,
        id: &str,
        expected: SpecState,
        next: SpecState,
        detail: Option<&str>,
    ) -> Result<Option<StateTransition>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let updated = tx
            .execute(
                "UPDATE game_specs SET state = ?1 WHERE id = ?2 AND state = ?3",
                params![next.as_str(), id, expected.as_str()],
            )
            .context("Failed to update spec state")?;
        if updated == 0 {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO spec_state_logs (game_spec_id, state_before, state_after, detail)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, expected.as_str(), next.as_str(), detail],
        )
        .context("Failed to insert state record")?;
        let record_id = tx.last_insert_rowid();

        tx.commit().context("Failed to commit state transition")?;
        self.get_state_log(record_id)?
            .context("State record not found after insert")
            .map(Some)
    }

    fn get_state_log(&self, id: i64) -> Result<Option<StateTransition>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, game_spec_id, state_before, state_after, detail, created_at
                 FROM spec_state_logs WHERE id = ?1",
                params![id],
                StateLogRow::from_row,
            )
            .optional()
            .context("Failed to query state record")?;
        row.map(StateLogRow::into_transition).transpose()
    }

    /// Audit trail for a spec, oldest first.
    pub fn get_state_logs(&self, spec_id: &str) -> Result<Vec<StateTransition>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, game_spec_id, state_before, state_after, detail, created_at
                 FROM spec_state_logs WHERE game_spec_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare get_state_logs")?;
        let rows = stmt
            .query_map(params![spec_id], StateLogRow::from_row)
            .context("Failed to query state records")?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read state record")?.into_transition()?);
        }
        Ok(logs)
    }

    // ── Spec generation jobs ──────────────────────────────────────────

    pub fn create_spec_job(
        &self,
        id: &str,
        brief: &str,
        constraints: Option<&serde_json::Value>,
    ) -> Result<SpecJob> {
        let constraints = constraints
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize constraints")?;
        self.conn
            .execute(
                "INSERT INTO spec_jobs (id, status, brief, constraints) VALUES (?1, ?2, ?3, ?4)",
                params![id, SpecJobStatus::Queued.as_str(), brief, constraints],
            )
            .context("Failed to insert spec job")?;
        self.get_spec_job(id)?
            .context("Spec job not found after insert")
    }

    pub fn mark_spec_job_running(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE spec_jobs SET status = ?1, started_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?2",
                params![SpecJobStatus::Running.as_str(), id],
            )
            .context("Failed to mark spec job running")?;
        Ok(())
    }

    /// Record a duplicate verdict. `duplicates` is stored in the order the
    /// gateway returned it; the first entry's score becomes `score_similarity`.
    pub fn mark_spec_job_duplicate(&self, id: &str, duplicates: &[SimilarSpec]) -> Result<SpecJob> {
        let ids: Vec<&str> = duplicates.iter().map(|d| d.id.as_str()).collect();
        let duplicate_of = serde_json::to_string(&ids).context("Failed to serialize duplicate ids")?;
        let duplicate_list =
            serde_json::to_string(duplicates).context("Failed to serialize duplicate list")?;
        let top_score = duplicates.first().map(|d| d.score);

        self.conn
            .execute(
                "UPDATE spec_jobs SET status = ?1, duplicate_of = ?2, duplicate_list = ?3, score_similarity = ?4,
                 finished_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?5",
                params![
                    SpecJobStatus::Duplicate.as_str(),
                    duplicate_of,
                    duplicate_list,
                    top_score,
                    id
                ],
            )
            .context("Failed to mark spec job duplicate")?;
        self.get_spec_job(id)?
            .context("Spec job not found after duplicate update")
    }

    pub fn mark_spec_job_completed(&self, id: &str, result_spec_id: &str) -> Result<SpecJob> {
        self.conn
            .execute(
                "UPDATE spec_jobs SET status = ?1, result_spec_id = ?2,
                 finished_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?3",
                params![SpecJobStatus::Completed.as_str(), result_spec_id, id],
            )
            .context("Failed to mark spec job completed")?;
        self.get_spec_job(id)?
            .context("Spec job not found after completion")
    }

    pub fn mark_spec_job_failed(&self, id: &str, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE spec_jobs SET status = ?1, error = ?2,
                 finished_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?3",
                params![SpecJobStatus::Failed.as_str(), error, id],
            )
            .context("Failed to mark spec job failed")?;
        Ok(())
    }

    pub fn get_spec_job(&self, id: &str) -> Result<Option<SpecJob>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, status, brief, constraints, result_spec_id, duplicate_of, duplicate_list,
                        score_similarity, error, created_at, started_at, finished_at
                 FROM spec_jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SpecJobRow {
                        id: row.get(0)?,
                        status: row.get(1)?,
                        brief: row.get(2)?,
                        constraints: row.get(3)?,
                        result_spec_id: row.get(4)?,
                        duplicate_of: row.get(5)?,
                        duplicate_list: row.get(6)?,
                        score_similarity: row.get(7)?,
                        error: row.get(8)?,
                        created_at: row.get(9)?,
                        started_at: row.get(10)?,
                        finished_at: row.get(11)?,
                    })
                },
            )
            .optional()
            .context("Failed to query spec job")?;
        row.map(SpecJobRow::into_spec_job).transpose()
    }

    #[cfg(test)]
    pub(crate) fn count_spec_jobs_with_status(&self, status: SpecJobStatus) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM spec_jobs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count spec jobs")
    }

    // ── Code generation jobs ──────────────────────────────────────────

    /// Insert a queued code job unless the spec already has one queued or
    /// processing, in which case `Ok(None)` is returned.
    pub fn create_code_job(
        &self,
        id: &str,
        game_spec_id: &str,
        game_spec: &serde_json::Value,
        output_path: Option<&str>,
    ) -> Result<Option<CodeJob>> {
        if self.active_code_job_for_spec(game_spec_id)?.is_some() {
            return Ok(None);
        }

        let snapshot = serde_json::to_string(game_spec).context("Failed to serialize game spec")?;
        self.conn
            .execute(
                "INSERT INTO code_jobs (id, game_spec_id, game_spec, output_path, status, progress, logs)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, '[]')",
                params![
                    id,
                    game_spec_id,
                    snapshot,
                    output_path,
                    CodeJobStatus::Queued.as_str()
                ],
            )
            .context("Failed to insert code job")?;
        self.get_code_job(id)
    }

    pub fn get_code_job(&self, id: &str) -> Result<Option<CodeJob>> {
        self.query_code_job("WHERE id = ?1", id)
    }

    /// Most recently created job for a spec; ties go to the later insert.
    pub fn latest_code_job_for_spec(&self, spec_id: &str) -> Result<Option<CodeJob>> {
        self.query_code_job(
            "WHERE game_spec_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            spec_id,
        )
    }

    pub fn active_code_job_for_spec(&self, spec_id: &str) -> Result<Option<CodeJob>> {
        self.query_code_job(
            "WHERE game_spec_id = ?1 AND status IN ('queued', 'processing')
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            spec_id,
        )
    }

    fn query_code_job(&self, filter: &str, arg: &str) -> Result<Option<CodeJob>> {
        let sql = format!(
            "SELECT id, game_spec_id, game_spec, output_path, status, progress, artifact_url, error, logs,
                    started_at, created_at, updated_at
             FROM code_jobs {}",
            filter
        );
        let row = self
            .conn
            .query_row(&sql, params![arg], |row| {
                Ok(CodeJobRow {
                    id: row.get(0)?,
                    game_spec_id: row.get(1)?,
                    game_spec: row.get(2)?,
                    output_path: row.get(3)?,
                    status: row.get(4)?,
                    progress: row.get(5)?,
                    artifact_url: row.get(6)?,
                    error: row.get(7)?,
                    logs: row.get(8)?,
                    started_at: row.get(9)?,
                    created_at: row.get(10)?,
                    updated_at: row.get(11)?,
                })
            })
            .optional()
            .context("Failed to query code job")?;
        row.map(CodeJobRow::into_code_job).transpose()
    }

    /// Take ownership of a queued job: `queued → processing` at 20%.
    /// Returns `false` if the job is no longer queued.
    pub fn claim_code_job(&self, id: &str, logs: &[String]) -> Result<bool> {
        let logs = serde_json::to_string(logs).context("Failed to serialize job logs")?;
        let count = self
            .conn
            .execute(
                "UPDATE code_jobs SET status = 'processing', progress = 20, logs = ?1,
                 started_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?2 AND status = 'queued'",
                params![logs, id],
            )
            .context("Failed to claim code job")?;
        Ok(count > 0)
    }

    /// Apply a worker's status/progress update. `logs` replaces the stored
    /// array; `error`, `artifact_url` and `output_path` are only written when
    /// set. Only a `processing` job can be updated: returns `Ok(None)` when the
    /// job was reaped, cancelled or deleted, i.e. the worker no longer owns it.
    pub fn update_code_job(&self, id: &str, update: &CodeJobUpdate) -> Result<Option<CodeJob>> {
        self.apply_code_job_update(id, CodeJobStatus::Processing, update)
    }

    /// Fail a job that never left the queue (e.g. the queue was full).
    /// Returns `Ok(None)` if the job is no longer queued.
    pub fn reject_queued_code_job(&self, id: &str, update: &CodeJobUpdate) -> Result<Option<CodeJob>> {
        self.apply_code_job_update(id, CodeJobStatus::Queued, update)
    }

    fn apply_code_job_update(
        &self,
        id: &str,
        expected: CodeJobStatus,
        update: &CodeJobUpdate,
    ) -> Result<Option<CodeJob>> {
        let logs = serde_json::to_string(&update.logs).context("Failed to serialize job logs")?;
        let count = self
            .conn
            .execute(
                "UPDATE code_jobs SET status = ?1, progress = ?2, logs = ?3,
                 error = COALESCE(?4, error),
                 artifact_url = COALESCE(?5, artifact_url),
                 output_path = COALESCE(?6, output_path),
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?7 AND status = ?8",
                params![
                    update.status.as_str(),
                    update.progress,
                    logs,
                    update.error,
                    update.artifact_url,
                    update.output_path,
                    id,
                    expected.as_str()
                ],
            )
            .context("Failed to update code job")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_code_job(id)
    }

    /// IDs of jobs still waiting for a worker, oldest first.
    pub fn queued_code_job_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM code_jobs WHERE status = 'queued' ORDER BY created_at ASC, rowid ASC")
            .context("Failed to prepare queued_code_job_ids")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query queued code jobs")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read code job id")?);
        }
        Ok(ids)
    }

    /// Fail every queued/processing job whose `updated_at` is older than
    /// `cutoff` (same `%Y-%m-%dT%H:%M:%S%.3fZ` format as the stored timestamps).
    /// Returns the IDs that were reaped.
    pub fn reap_stale_code_jobs(&self, cutoff: &str, error: &str) -> Result<Vec<String>> {
        self.fail_code_jobs_matching(
            "status IN ('queued', 'processing') AND updated_at < ?1",
            &[&cutoff],
            error,
        )
    }

    /// Fail every `processing` job regardless of age. Used when no worker in
    /// this process can still own one: at startup and after shutdown drains.
    pub fn fail_processing_code_jobs(&self, error: &str) -> Result<Vec<String>> {
        self.fail_code_jobs_matching("status = 'processing'", &[], error)
    }

    /// Prepare a spec for deletion. If one of its code jobs is `processing`,
    /// nothing changes and that job's ID is returned. Otherwise its queued
    /// jobs are failed with `error`, so no worker can claim them afterwards.
    pub fn fence_code_jobs_for_delete(&self, spec_id: &str, error: &str) -> Result<Option<String>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let running: Option<String> = tx
            .query_row(
                "SELECT id FROM code_jobs WHERE game_spec_id = ?1 AND status = 'processing' LIMIT 1",
                params![spec_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query processing code jobs")?;
        if running.is_some() {
            return Ok(running);
        }

        tx.execute(
            "UPDATE code_jobs SET status = 'failed', error = ?1,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE game_spec_id = ?2 AND status = 'queued'",
            params![error, spec_id],
        )
        .context("Failed to cancel queued code jobs")?;
        tx.commit().context("Failed to commit code job fence")?;
        Ok(None)
    }

    fn fail_code_jobs_matching(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
        error: &str,
    ) -> Result<Vec<String>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let ids = {
            let mut stmt = tx
                .prepare(&format!("SELECT id FROM code_jobs WHERE {}", filter))
                .context("Failed to prepare code job query")?;
            let rows = stmt
                .query_map(args, |row| row.get::<_, String>(0))
                .context("Failed to query code jobs")?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.context("Failed to read code job id")?);
            }
            ids
        };

        for id in &ids {
            tx.execute(
                "UPDATE code_jobs SET status = 'failed', error = ?1,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to fail code job")?;
        }

        tx.commit().context("Failed to commit failed code jobs")?;
        Ok(ids)
    }
}

fn parse_state(s: &str) -> Result<SpecState> {
    SpecState::from_str(s)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse spec state")
}

/// Intermediate row struct for game_specs before parsing the stored JSON
/// document and state label.
struct GameSpecRow {
    id: String,
    title: String,
    brief: String,
    spec_markdown: String,
    spec_json: String,
    spec_hash: String,
    genre: Option<String>,
    duration_sec: Option<i64>,
    state: String,
    devin_session_id: Option<String>,
    created_at: String,
}

impl GameSpecRow {
    fn into_game_spec(self) -> Result<GameSpec> {
        let spec_json =
            serde_json::from_str(&self.spec_json).context("Failed to parse stored spec_json")?;
        Ok(GameSpec {
            id: self.id,
            title: self.title,
            brief: self.brief,
            spec_markdown: self.spec_markdown,
            spec_json,
            spec_hash: self.spec_hash,
            genre: self.genre,
            duration_sec: self.duration_sec,
            state: parse_state(&self.state)?,
            devin_session_id: self.devin_session_id,
            created_at: self.created_at,
        })
    }
}

struct StateLogRow {
    id: i64,
    game_spec_id: String,
    state_before: Option<String>,
    state_after: String,
    detail: Option<String>,
    created_at: String,
}

impl StateLogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            game_spec_id: row.get(1)?,
            state_before: row.get(2)?,
            state_after: row.get(3)?,
            detail: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_transition(self) -> Result<StateTransition> {
        Ok(StateTransition {
            id: self.id,
            game_spec_id: self.game_spec_id,
            state_before: self.state_before.as_deref().map(parse_state).transpose()?,
            state_after: parse_state(&self.state_after)?,
            detail: self.detail,
            created_at: self.created_at,
        })
    }
}

struct SpecJobRow {
    id: String,
    status: String,
    brief: String,
    constraints: Option<String>,
    result_spec_id: Option<String>,
    duplicate_of: String,
    duplicate_list: String,
    score_similarity: Option<f64>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl SpecJobRow {
    fn into_spec_job(self) -> Result<SpecJob> {
        let status = SpecJobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse spec job status")?;
        let constraints = self
            .constraints
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse spec job constraints")?;
        Ok(SpecJob {
            id: self.id,
            status,
            brief: self.brief,
            constraints,
            result_spec_id: self.result_spec_id,
            duplicate_of: serde_json::from_str(&self.duplicate_of)
                .context("Failed to parse duplicate_of JSON")?,
            duplicate_list: serde_json::from_str(&self.duplicate_list)
                .context("Failed to parse duplicate_list JSON")?,
            score_similarity: self.score_similarity,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

struct CodeJobRow {
    id: String,
    game_spec_id: Option<String>,
    game_spec: String,
    output_path: Option<String>,
    status: String,
    progress: i32,
    artifact_url: Option<String>,
    error: Option<String>,
    logs: String,
    started_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CodeJobRow {
    fn into_code_job(self) -> Result<CodeJob> {
        let status = CodeJobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse code job status")?;
        Ok(CodeJob {
            id: self.id,
            game_spec_id: self.game_spec_id,
            game_spec: serde_json::from_str(&self.game_spec)
                .context("Failed to parse code job snapshot")?,
            output_path: self.output_path,
            status,
            progress: self.progress,
            artifact_url: self.artifact_url,
            error: self.error,
            logs: serde_json::from_str(&self.logs).context("Failed to parse code job logs")?,
            started_at: self.started_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
