//! SQLite results store for benchmark runs, samples and phase outcomes

use crate::error::{AeroBenchError, Result};
use crate::fanout::OutcomeSummary;
use crate::models::{BenchmarkConfig, Sample, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle state of a benchmark run
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "succeeded" => RunStatus::Succeeded,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "success" => TaskStatus::Success,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Failed,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub benchmark: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

/// A task outcome as persisted, tagged with its phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcomeRecord {
    pub phase: String,
    #[serde(flatten)]
    pub outcome: OutcomeSummary,
}

/// Persistent record of runs and their results
#[derive(Clone)]
pub struct ResultStore {
    conn: Arc<Mutex<Connection>>,
}

impl ResultStore {
    /// Open (or create) the store at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AeroBenchError::Other("results store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                benchmark TEXT NOT NULL,
                started_at TIMESTAMP NOT NULL,
                completed_at TIMESTAMP,
                status TEXT NOT NULL,
                config TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT NOT NULL,
                metadata TEXT NOT NULL,
                timestamp TIMESTAMP NOT NULL,
                FOREIGN KEY (run_id) REFERENCES runs(id)
            );

            CREATE TABLE IF NOT EXISTS phase_outcomes (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                task_index INTEGER NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                FOREIGN KEY (run_id) REFERENCES runs(id)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_samples_run ON samples(run_id);
            CREATE INDEX IF NOT EXISTS idx_phase_outcomes_run ON phase_outcomes(run_id);
            ",
        )?;

        Ok(())
    }

    /// Register a new run and return its id
    pub fn start_run(&self, config: &BenchmarkConfig) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let snapshot = serde_json::to_string(config)?;
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO runs (id, benchmark, started_at, status, config) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                config.name,
                Utc::now(),
                RunStatus::Running.to_string(),
                snapshot
            ],
        )?;

        debug!(run_id = %id, "Started run");
        Ok(id)
    }

    pub fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status.to_string(), Utc::now(), run_id],
        )?;
        Ok(())
    }

    pub fn record_samples(&self, run_id: &str, samples: &[Sample]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (run_id, metric, value, unit, metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for sample in samples {
                // SQLite stores NaN as NULL, which the schema rejects
                if !sample.value.is_finite() {
                    warn!(metric = %sample.metric, "Not storing non-finite sample value {}", sample.value);
                    continue;
                }
                stmt.execute(params![
                    run_id,
                    sample.metric,
                    sample.value,
                    sample.unit,
                    serde_json::to_string(&sample.metadata)?,
                    sample.timestamp
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn record_outcomes(
        &self,
        run_id: &str,
        phase: &str,
        outcomes: &[OutcomeSummary],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO phase_outcomes (run_id, phase, task_index, target, status, error, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for outcome in outcomes {
                stmt.execute(params![
                    run_id,
                    phase,
                    outcome.index as i64,
                    outcome.target,
                    outcome.status.to_string(),
                    outcome.error,
                    outcome.duration.as_millis() as i64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                "SELECT id, benchmark, started_at, completed_at, status FROM runs WHERE id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, benchmark, started_at, completed_at, status
             FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn get_samples(&self, run_id: &str) -> Result<Vec<Sample>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT metric, value, unit, metadata, timestamp
             FROM samples WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut samples = Vec::with_capacity(rows.len());
        for (metric, value, unit, metadata, timestamp) in rows {
            let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&metadata)?;
            samples.push(Sample {
                metric,
                value,
                unit,
                metadata,
                timestamp,
            });
        }
        Ok(samples)
    }

    pub fn get_outcomes(&self, run_id: &str) -> Result<Vec<PhaseOutcomeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT phase, task_index, target, status, error, duration_ms
             FROM phase_outcomes WHERE run_id = ?1 ORDER BY id",
        )?;
        let outcomes = stmt
            .query_map(params![run_id], |row| {
                Ok(PhaseOutcomeRecord {
                    phase: row.get(0)?,
                    outcome: OutcomeSummary {
                        index: row.get::<_, i64>(1)? as usize,
                        target: row.get(2)?,
                        status: parse_task_status(&row.get::<_, String>(3)?),
                        error: row.get(4)?,
                        duration: Duration::from_millis(row.get::<_, i64>(5)?.max(0) as u64),
                    },
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(outcomes)
    }

    /// Mark runs left in `running` by a crashed process as failed
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare("SELECT id FROM runs WHERE status = ?1")?;
        let interrupted: Vec<String> = stmt
            .query_map(params![RunStatus::Running.to_string()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for id in &interrupted {
            conn.execute(
                "UPDATE runs SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![RunStatus::Failed.to_string(), Utc::now(), id],
            )?;
        }

        Ok(interrupted)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        benchmark: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        status: parse_run_status(&row.get::<_, String>(4)?),
    })
}
