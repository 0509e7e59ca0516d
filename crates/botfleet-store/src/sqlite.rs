//! SQLite-backed persistence for the research orchestrator.
//!
//! One connection behind a mutex; every public method is a short critical
//! section so callers on worker tasks never hold the lock across an await.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use botfleet_core::{
    Alert, CandidateFingerprint, Error, JobStatus, OrchestratorState, ResearchJob, ResearchMode,
    Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::schema::{ALERTS_SCHEMA_SQL, FINGERPRINT_SCHEMA_SQL, JOBS_SCHEMA_SQL, STATE_SCHEMA_SQL};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open or create the store. The file will be `db_dir/orchestrator.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("orchestrator.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        let counts = store.count_jobs(None)?;
        info!(
            "SqliteStore initialized: {} jobs ({} queued, {} running), path={}",
            counts.total(),
            counts.queued,
            counts.running,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!(
            "{}\n{}\n{}\n{}",
            JOBS_SCHEMA_SQL, STATE_SCHEMA_SQL, FINGERPRINT_SCHEMA_SQL, ALERTS_SCHEMA_SQL
        );
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------------------------------------------------------
    // Research jobs
    // ---------------------------------------------------------------

    pub fn insert_job(&self, job: &ResearchJob) -> Result<()> {
        let conn = self.conn.lock();
        Self::insert_job_with(&conn, job)
    }

    fn insert_job_with(conn: &Connection, job: &ResearchJob) -> Result<()> {
        conn.prepare_cached(
            "INSERT INTO research_jobs (
                id, mode, status, priority, cost_class, trigger_kind, subject, params_json,
                fingerprint_hash, estimated_cost_usd, cost_usd, candidates_created, attempts,
                created_at, scheduled_for, started_at, completed_at, error_message, deferred_reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                       ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        )
        .map_err(db_err)?
        .execute(params![
            job.id,
            job.mode.as_str(),
            job.status.as_str(),
            job.priority,
            job.cost_class.as_str(),
            job.trigger.as_str(),
            job.subject,
            job.params.to_string(),
            job.fingerprint_hash,
            job.estimated_cost_usd,
            job.cost_usd,
            job.candidates_created,
            job.attempts,
            to_millis(job.created_at),
            to_millis(job.scheduled_for),
            job.started_at.map(to_millis),
            job.completed_at.map(to_millis),
            job.error_message,
            job.deferred_reason,
        ])
        .map_err(db_err)?;
        Ok(())
    }

    /// Write back the mutable lifecycle columns of a job.
    pub fn update_job(&self, job: &ResearchJob) -> Result<()> {
        let conn = self.conn.lock();
        let count = conn
            .prepare_cached(
                "UPDATE research_jobs SET
                    status = ?2, cost_usd = ?3, candidates_created = ?4, attempts = ?5,
                    started_at = ?6, completed_at = ?7, error_message = ?8, deferred_reason = ?9
                 WHERE id = ?1",
            )
            .map_err(db_err)?
            .execute(params![
                job.id,
                job.status.as_str(),
                job.cost_usd,
                job.candidates_created,
                job.attempts,
                job.started_at.map(to_millis),
                job.completed_at.map(to_millis),
                job.error_message,
                job.deferred_reason,
            ])
            .map_err(db_err)?;
        if count == 0 {
            return Err(Error::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    /// Insert a job and save the orchestrator state in one transaction.
    ///
    /// Used for dispatch so a crash can never leave a job without the
    /// matching `last<Mode>At` update, or the reverse.
    pub fn record_dispatch(&self, job: &ResearchJob, state: &OrchestratorState) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::insert_job_with(&tx, job)?;
        Self::save_state_with(&tx, state)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<ResearchJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM research_jobs WHERE id = ?1")
            .map_err(db_err)?;
        let row = stmt
            .query_row(params![job_id], Self::row_to_job)
            .optional()
            .map_err(db_err)?;
        Ok(row)
    }

    /// Most recent jobs first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ResearchJob>> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM research_jobs
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR mode = ?2)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.mode.map(|m| m.as_str()),
                    limit as i64
                ],
                Self::row_to_job,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// All jobs in a status, oldest first.
    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<ResearchJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM research_jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.as_str()], Self::row_to_job)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Count jobs by status. With `since`, only jobs whose last lifecycle
    /// event (completion, or creation if unfinished) is at or after it.
    pub fn count_jobs(&self, since: Option<DateTime<Utc>>) -> Result<JobCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT status, COUNT(*) FROM research_jobs
                 WHERE ?1 IS NULL OR COALESCE(completed_at, created_at) >= ?1
                 GROUP BY status",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![since.map(to_millis)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            let status = JobStatus::from_str(&status)?;
            counts.add(status, count.max(0) as usize);
        }
        Ok(counts)
    }

    fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ResearchJob> {
        Ok(ResearchJob {
            id: row.get("id")?,
            mode: parse_column(row, "mode")?,
            status: parse_column(row, "status")?,
            priority: row.get("priority")?,
            cost_class: parse_column(row, "cost_class")?,
            trigger: parse_column(row, "trigger_kind")?,
            subject: row.get("subject")?,
            params: row
                .get::<_, Option<String>>("params_json")?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            fingerprint_hash: row.get("fingerprint_hash")?,
            estimated_cost_usd: row.get("estimated_cost_usd")?,
            cost_usd: row.get("cost_usd")?,
            candidates_created: row.get("candidates_created")?,
            attempts: row.get("attempts")?,
            created_at: from_millis(row.get("created_at")?),
            scheduled_for: from_millis(row.get("scheduled_for")?),
            started_at: row.get::<_, Option<i64>>("started_at")?.map(from_millis),
            completed_at: row.get::<_, Option<i64>>("completed_at")?.map(from_millis),
            error_message: row.get("error_message")?,
            deferred_reason: row.get("deferred_reason")?,
        })
    }

    // ---------------------------------------------------------------
    // Orchestrator state
    // ---------------------------------------------------------------

    pub fn load_state(&self) -> Result<Option<OrchestratorState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM orchestrator_state WHERE id = 1")
            .map_err(db_err)?;
        let row = stmt
            .query_row([], Self::row_to_state)
            .optional()
            .map_err(db_err)?;
        Ok(row)
    }

    pub fn save_state(&self, state: &OrchestratorState) -> Result<()> {
        let conn = self.conn.lock();
        Self::save_state_with(&conn, state)
    }

    fn save_state_with(conn: &Connection, state: &OrchestratorState) -> Result<()> {
        let modes: Vec<&str> = state.enabled_modes.iter().map(|m| m.as_str()).collect();
        conn.prepare_cached(
            "INSERT INTO orchestrator_state (
                id, is_full_spectrum_enabled, enabled_modes_json, last_sentiment_at,
                last_contrarian_at, last_deep_reasoning_at, daily_cost_usd, daily_job_count,
                budget_reset_at, updated_at
             ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                is_full_spectrum_enabled = excluded.is_full_spectrum_enabled,
                enabled_modes_json = excluded.enabled_modes_json,
                last_sentiment_at = excluded.last_sentiment_at,
                last_contrarian_at = excluded.last_contrarian_at,
                last_deep_reasoning_at = excluded.last_deep_reasoning_at,
                daily_cost_usd = excluded.daily_cost_usd,
                daily_job_count = excluded.daily_job_count,
                budget_reset_at = excluded.budget_reset_at,
                updated_at = excluded.updated_at",
        )
        .map_err(db_err)?
        .execute(params![
            state.is_full_spectrum_enabled,
            serde_json::to_string(&modes)?,
            state.last_sentiment_at.map(to_millis),
            state.last_contrarian_at.map(to_millis),
            state.last_deep_reasoning_at.map(to_millis),
            state.daily_cost_usd,
            state.daily_job_count,
            to_millis(state.budget_reset_at),
            to_millis(state.updated_at),
        ])
        .map_err(db_err)?;
        Ok(())
    }

    fn row_to_state(row: &Row<'_>) -> rusqlite::Result<OrchestratorState> {
        let modes_json: String = row.get("enabled_modes_json")?;
        let enabled_modes: BTreeSet<ResearchMode> = serde_json::from_str::<Vec<String>>(&modes_json)
            .unwrap_or_default()
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        Ok(OrchestratorState {
            is_full_spectrum_enabled: row.get("is_full_spectrum_enabled")?,
            enabled_modes,
            last_sentiment_at: row.get::<_, Option<i64>>("last_sentiment_at")?.map(from_millis),
            last_contrarian_at: row.get::<_, Option<i64>>("last_contrarian_at")?.map(from_millis),
            last_deep_reasoning_at: row
                .get::<_, Option<i64>>("last_deep_reasoning_at")?
                .map(from_millis),
            daily_cost_usd: row.get("daily_cost_usd")?,
            daily_job_count: row.get("daily_job_count")?,
            budget_reset_at: from_millis(row.get("budget_reset_at")?),
            updated_at: from_millis(row.get("updated_at")?),
        })
    }

    // ---------------------------------------------------------------
    // Fingerprints
    // ---------------------------------------------------------------

    pub fn upsert_fingerprint(&self, fp: &CandidateFingerprint) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO candidate_fingerprints
                (fingerprint_hash, hit_count, created_at, last_seen_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(fingerprint_hash) DO UPDATE SET
                hit_count = excluded.hit_count,
                created_at = excluded.created_at,
                last_seen_at = excluded.last_seen_at,
                expires_at = excluded.expires_at",
        )
        .map_err(db_err)?
        .execute(params![
            fp.fingerprint_hash,
            fp.hit_count,
            to_millis(fp.created_at),
            to_millis(fp.last_seen_at),
            to_millis(fp.expires_at),
        ])
        .map_err(db_err)?;
        Ok(())
    }

    /// Fingerprints still live at `now`.
    pub fn load_live_fingerprints(&self, now: DateTime<Utc>) -> Result<Vec<CandidateFingerprint>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM candidate_fingerprints WHERE expires_at > ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![to_millis(now)], |row| {
                Ok(CandidateFingerprint {
                    fingerprint_hash: row.get("fingerprint_hash")?,
                    hit_count: row.get("hit_count")?,
                    created_at: from_millis(row.get("created_at")?),
                    last_seen_at: from_millis(row.get("last_seen_at")?),
                    expires_at: from_millis(row.get("expires_at")?),
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn delete_expired_fingerprints(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "DELETE FROM candidate_fingerprints WHERE expires_at <= ?1",
                params![to_millis(now)],
            )
            .map_err(db_err)?;
        if count > 0 {
            debug!("Deleted {} expired fingerprints", count);
        }
        Ok(count)
    }

    pub fn delete_fingerprints(&self, hashes: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let mut count = 0;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM candidate_fingerprints WHERE fingerprint_hash = ?1")
                .map_err(db_err)?;
            for hash in hashes {
                count += stmt.execute(params![hash]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(count)
    }

    // ---------------------------------------------------------------
    // Alerts
    // ---------------------------------------------------------------

    pub fn upsert_alert(&self, alert: &Alert) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO alerts
                (id, alert_type, severity, message, acknowledged, acknowledged_at,
                 created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                severity = excluded.severity,
                message = excluded.message,
                acknowledged = excluded.acknowledged,
                acknowledged_at = excluded.acknowledged_at,
                resolved_at = excluded.resolved_at",
        )
        .map_err(db_err)?
        .execute(params![
            alert.id,
            alert.alert_type.as_str(),
            alert.severity.as_str(),
            alert.message,
            alert.acknowledged,
            alert.acknowledged_at.map(to_millis),
            to_millis(alert.created_at),
            alert.resolved_at.map(to_millis),
        ])
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM alerts WHERE id = ?1")
            .map_err(db_err)?;
        let row = stmt
            .query_row(params![alert_id], Self::row_to_alert)
            .optional()
            .map_err(db_err)?;
        Ok(row)
    }

    /// Alerts not yet both acknowledged and resolved.
    pub fn load_open_alerts(&self) -> Result<Vec<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM alerts
                 WHERE NOT (acknowledged = 1 AND resolved_at IS NOT NULL)
                 ORDER BY created_at ASC",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], Self::row_to_alert).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Alert history, newest first.
    pub fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM alerts ORDER BY created_at DESC LIMIT ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_alert)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
        Ok(Alert {
            id: row.get("id")?,
            alert_type: parse_column(row, "alert_type")?,
            severity: parse_column(row, "severity")?,
            message: row.get("message")?,
            acknowledged: row.get("acknowledged")?,
            acknowledged_at: row.get::<_, Option<i64>>("acknowledged_at")?.map(from_millis),
            created_at: from_millis(row.get("created_at")?),
            resolved_at: row.get::<_, Option<i64>>("resolved_at")?.map(from_millis),
        })
    }

    // ---------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------

    pub fn get_stats(&self) -> Result<StoreStats> {
        let jobs = self.count_jobs(None)?;
        let conn = self.conn.lock();
        let fingerprints: i64 = conn
            .query_row("SELECT COUNT(*) FROM candidate_fingerprints", [], |r| r.get(0))
            .map_err(db_err)?;
        let alerts: i64 = conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))
            .map_err(db_err)?;
        drop(conn);

        let db_size_mb = std::fs::metadata(&self.db_path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        Ok(StoreStats {
            jobs,
            fingerprints,
            alerts,
            db_path: self.db_path.display().to_string(),
            db_size_mb: (db_size_mb * 100.0).round() / 100.0,
        })
    }
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn parse_column<T>(row: &Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let raw: String = row.get(name)?;
    raw.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
