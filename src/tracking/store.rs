//! SQLite-backed store for [`ExecutionTracking`] records.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{ExecutionStatus, ExecutionTracking, NewExecution, TrackingError};
use crate::pipeline::JobType;
use crate::storage::Pool;

const SELECT_COLUMNS: &str = "SELECT id, owner, study_id, requested_at, email_addresses_json,
    data_start, data_end, participants_json, datastreams_json, job_type, box_directory,
    batch_job_id, status, error_text, started_at, finished_at, execution_minutes
    FROM pipeline_executions";

/// Persists execution records and enforces the lifecycle on every update.
#[derive(Clone)]
pub struct TrackingStore {
    pool: Pool,
}

impl TrackingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a new record in `SCHEDULED` state and return its id.
    pub fn create(&self, new: &NewExecution) -> Result<i64, TrackingError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO pipeline_executions (owner, study_id, requested_at, email_addresses_json,
                data_start, data_end, participants_json, datastreams_json, job_type, box_directory, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                new.owner,
                new.study_id,
                new.requested_at.to_rfc3339(),
                serde_json::to_string(&new.email_addresses)?,
                new.data_start.map(|d| d.to_rfc3339()),
                new.data_end.map(|d| d.to_rfc3339()),
                serde_json::to_string(&new.participants)?,
                serde_json::to_string(&new.datastreams)?,
                new.job_type.as_str(),
                new.box_directory,
                ExecutionStatus::Scheduled.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(pipeline_id = id, study_id = new.study_id, job_type = %new.job_type, "execution scheduled");
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<ExecutionTracking, TrackingError> {
        let conn = self.pool.get()?;
        fetch(&conn, id)?.ok_or(TrackingError::NotFound(id))
    }

    /// All records for a study, newest first.
    pub fn list_for_study(&self, study_id: i64) -> Result<Vec<ExecutionTracking>, TrackingError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{} WHERE study_id = ?1 ORDER BY id DESC", SELECT_COLUMNS))?;
        let rows = stmt.query_map(params![study_id], record_from_row)?;
        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    /// Attach the backend job id and move to `SUBMITTED`.
    ///
    /// A missing record is logged and reported as `Ok(false)` so a real
    /// submission success is never turned into an error by bookkeeping. A
    /// record that is already `RUNNING` keeps its status and only gains the id.
    pub fn mark_submitted(&self, id: i64, batch_job_id: &str) -> Result<bool, TrackingError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(record) = fetch(&tx, id)? else {
            tracing::warn!(pipeline_id = id, %batch_job_id, "cannot record batch job id: execution not found");
            return Ok(false);
        };
        if let Some(existing) = record.batch_job_id {
            return Err(TrackingError::BatchJobIdAlreadySet { id, existing });
        }
        let status = if record.status == ExecutionStatus::Running {
            ExecutionStatus::Running
        } else {
            check_transition(&record, ExecutionStatus::Submitted)?;
            ExecutionStatus::Submitted
        };

        tx.execute(
            "UPDATE pipeline_executions SET batch_job_id = ?1, status = ?2 WHERE id = ?3",
            params![batch_job_id, status.as_str(), id],
        )?;
        tx.commit()?;

        tracing::info!(pipeline_id = id, %batch_job_id, "execution submitted");
        Ok(true)
    }

    /// Executing job reports that it has started.
    pub fn mark_started(&self, id: i64, when: DateTime<Utc>) -> Result<(), TrackingError> {
        self.transition(id, ExecutionStatus::Running, |tx, _| {
            tx.execute(
                "UPDATE pipeline_executions SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![ExecutionStatus::Running.as_str(), when.to_rfc3339(), id],
            )
        })
    }

    /// Executing job reports successful completion.
    pub fn mark_completed(&self, id: i64, when: DateTime<Utc>) -> Result<(), TrackingError> {
        self.finish(id, ExecutionStatus::Completed, when, None)
    }

    pub fn mark_crashed(&self, id: i64, when: DateTime<Utc>, reason: &str) -> Result<(), TrackingError> {
        self.finish(id, ExecutionStatus::Crashed, when, Some(reason))
    }

    pub fn mark_terminated(&self, id: i64, when: DateTime<Utc>, reason: &str) -> Result<(), TrackingError> {
        self.finish(id, ExecutionStatus::Terminated, when, Some(reason))
    }

    fn finish(
        &self,
        id: i64,
        to: ExecutionStatus,
        when: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<(), TrackingError> {
        self.transition(id, to, |tx, record| {
            tx.execute(
                "UPDATE pipeline_executions
                 SET status = ?1, finished_at = ?2, execution_minutes = ?3, error_text = COALESCE(?4, error_text)
                 WHERE id = ?5",
                params![to.as_str(), when.to_rfc3339(), record.minutes_until(when), reason, id],
            )
        })
    }

    /// Load, validate and update one record inside a single write transaction.
    fn transition<F>(&self, id: i64, to: ExecutionStatus, apply: F) -> Result<(), TrackingError>
    where
        F: FnOnce(&Connection, &ExecutionTracking) -> rusqlite::Result<usize>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = fetch(&tx, id)?.ok_or(TrackingError::NotFound(id))?;
        check_transition(&record, to)?;
        apply(&tx, &record)?;
        tx.commit()?;

        tracing::info!(pipeline_id = id, from = %record.status, %to, "execution state changed");
        Ok(())
    }
}

fn check_transition(record: &ExecutionTracking, to: ExecutionStatus) -> Result<(), TrackingError> {
    if record.status.can_transition_to(to) {
        Ok(())
    } else {
        tracing::warn!(pipeline_id = record.id, from = %record.status, %to, "rejected state change");
        Err(TrackingError::IllegalTransition {
            id: record.id,
            from: record.status,
            to,
        })
    }
}

fn fetch(conn: &Connection, id: i64) -> Result<Option<ExecutionTracking>, TrackingError> {
    Ok(conn
        .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), params![id], record_from_row)
        .optional()?)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn string_list(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionTracking> {
    let job_type: String = row.get(9)?;
    let status: String = row.get(12)?;

    Ok(ExecutionTracking {
        id: row.get(0)?,
        owner: row.get(1)?,
        study_id: row.get(2)?,
        requested_at: timestamp(row, 3)?,
        email_addresses: string_list(row, 4)?,
        data_start: optional_timestamp(row, 5)?,
        data_end: optional_timestamp(row, 6)?,
        participants: string_list(row, 7)?,
        datastreams: string_list(row, 8)?,
        job_type: job_type.parse::<JobType>().map_err(|e| conversion_error(9, e))?,
        box_directory: row.get(10)?,
        batch_job_id: row.get(11)?,
        status: status.parse::<ExecutionStatus>().map_err(|e| conversion_error(12, e))?,
        error_text: row.get(13)?,
        started_at: optional_timestamp(row, 14)?,
        finished_at: optional_timestamp(row, 15)?,
        execution_minutes: row.get(16)?,
    })
}
