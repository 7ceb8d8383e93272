use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{AssistantError, Result};
use crate::prompt::AssembledPrompt;
use crate::queue::{JobState, PromptJob};

/// SQLite record of the queue, so an interrupted session picks up where it
/// stopped.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            -- One row per prompt job, updated on every state change
            CREATE TABLE IF NOT EXISTS prompt_jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                profile_ref TEXT,
                system_prompt TEXT NOT NULL,
                user_prompt TEXT NOT NULL,
                model TEXT NOT NULL,
                temperature REAL NOT NULL DEFAULT 0.7,
                state TEXT NOT NULL,
                result TEXT,
                error TEXT,
                thinking TEXT,
                thinking_ms INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_prompt_jobs_state ON prompt_jobs(state);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AssistantError::Storage(rusqlite::Error::InvalidQuery))?;
        Ok(f(&conn)?)
    }

    /// Insert or replace the job's row.
    pub fn save_job(&self, job: &PromptJob) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO prompt_jobs (id, command, profile_ref, system_prompt, user_prompt, model, temperature,
                                          state, result, error, thinking, thinking_ms, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    result = excluded.result,
                    error = excluded.error,
                    thinking = excluded.thinking,
                    thinking_ms = excluded.thinking_ms,
                    updated_at = excluded.updated_at",
                params![
                    job.id,
                    job.command,
                    job.profile_ref,
                    job.prompt.system_prompt,
                    job.prompt.user_prompt,
                    job.model,
                    job.temperature as f64,
                    job.state.as_str(),
                    job.result,
                    job.error,
                    job.thinking,
                    job.thinking_ms.map(|ms| ms as i64),
                    timestamp(&job.created_at),
                    timestamp(&job.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_job(&self, id: &str) -> Result<Option<PromptJob>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM prompt_jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                row_to_job,
            )
            .optional()
        })
    }

    /// Jobs that were RUNNING when the process stopped go back to PENDING.
    /// Run once at startup, before the worker starts.
    pub fn recover_interrupted(&self) -> Result<usize> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE prompt_jobs SET state = ?1, updated_at = ?2 WHERE state = ?3",
                params![
                    JobState::Pending.as_str(),
                    timestamp(&Utc::now()),
                    JobState::Running.as_str()
                ],
            )
        })
    }

    /// PENDING and PAUSED jobs, oldest first.
    pub fn load_unfinished(&self) -> Result<Vec<PromptJob>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM prompt_jobs WHERE state IN (?1, ?2) ORDER BY created_at ASC, rowid ASC",
                JOB_COLUMNS
            ))?;
            let jobs = stmt.query_map(
                params![JobState::Pending.as_str(), JobState::Paused.as_str()],
                row_to_job,
            )?;
            jobs.collect()
        })
    }

    pub fn get_recent_jobs(&self, limit: usize) -> Result<Vec<PromptJob>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM prompt_jobs ORDER BY updated_at DESC LIMIT ?1",
                JOB_COLUMNS
            ))?;
            let jobs = stmt.query_map([limit as i64], row_to_job)?;
            jobs.collect()
        })
    }

    /// Remove finished jobs last touched before `cutoff`.
    pub fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM prompt_jobs WHERE state IN (?1, ?2) AND updated_at < ?3",
                params![
                    JobState::Done.as_str(),
                    JobState::Error.as_str(),
                    timestamp(&cutoff)
                ],
            )
        })
    }
}

const JOB_COLUMNS: &str = "id, command, profile_ref, system_prompt, user_prompt, model, temperature, \
                           state, result, error, thinking, thinking_ms, created_at, updated_at";

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptJob> {
    let state: String = row.get(7)?;
    Ok(PromptJob {
        id: row.get(0)?,
        command: row.get(1)?,
        profile_ref: row.get(2)?,
        prompt: AssembledPrompt {
            system_prompt: row.get(3)?,
            user_prompt: row.get(4)?,
        },
        model: row.get(5)?,
        temperature: row.get::<_, f64>(6)? as f32,
        // Unknown states only come from a newer schema; treat them as failed.
        state: JobState::from_str(&state).unwrap_or(JobState::Error),
        result: row.get(8)?,
        error: row.get(9)?,
        thinking: row.get(10)?,
        thinking_ms: row.get::<_, Option<i64>>(11)?.map(|ms| ms.max(0) as u64),
        created_at: parse_timestamp(row.get(12)?),
        updated_at: parse_timestamp(row.get(13)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(command: &str) -> PromptJob {
        PromptJob::new(
            command,
            Some("lotka".into()),
            AssembledPrompt {
                system_prompt: "sys".into(),
                user_prompt: "user".into(),
            },
            "qwen3:8b",
        )
    }

    #[test]
    fn test_save_and_update_job() {
        let store = JobStore::open_in_memory().unwrap();
        let mut j = job("quest");
        store.save_job(&j).unwrap();

        j.state = JobState::Done;
        j.result = Some("{\"tytul\": \"Most\"}".into());
        j.thinking_ms = Some(1200);
        store.save_job(&j).unwrap();

        let loaded = store.get_job(&j.id).unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Done);
        assert_eq!(loaded.result, j.result);
        assert_eq!(loaded.thinking_ms, Some(1200));
        assert_eq!(loaded.prompt, j.prompt);
        assert!(store.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn test_interrupted_jobs_are_recovered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");

        let first = {
            let store = JobStore::open(&path).unwrap();
            let mut running = job("quest");
            running.state = JobState::Running;
            let mut pending = job("hook");
            pending.created_at = running.created_at + chrono::Duration::seconds(1);
            let mut done = job("sekret");
            done.state = JobState::Done;
            store.save_job(&running).unwrap();
            store.save_job(&pending).unwrap();
            store.save_job(&done).unwrap();
            running.id
        };

        let store = JobStore::open(&path).unwrap();
        assert_eq!(store.recover_interrupted().unwrap(), 1);
        let unfinished = store.load_unfinished().unwrap();
        assert_eq!(unfinished.len(), 2);
        assert_eq!(unfinished[0].id, first);
        assert_eq!(unfinished[0].state, JobState::Pending);
        assert_eq!(unfinished[1].command, "hook");
    }

    #[test]
    fn test_delete_finished_before() {
        let store = JobStore::open_in_memory().unwrap();
        let mut done = job("quest");
        done.state = JobState::Error;
        done.updated_at = Utc::now() - chrono::Duration::days(30);
        store.save_job(&done).unwrap();
        store.save_job(&job("hook")).unwrap();

        let removed = store
            .delete_finished_before(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_recent_jobs(10).unwrap().len(), 1);
    }
}
