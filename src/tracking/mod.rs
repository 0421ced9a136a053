//! Execution tracking for submitted pipeline jobs.
//!
//! Every submission attempt gets one persistent record. The record is
//! written before the compute backend is called and then walks a monotonic
//! lifecycle:
//!
//! ```text
//! SCHEDULED -> SUBMITTED -> RUNNING -> COMPLETED
//!     |            |           |
//!     +------------+-----------+--> CRASHED | TERMINATED
//! ```
//!
//! `COMPLETED`, `CRASHED` and `TERMINATED` are terminal: the store rejects
//! any further transition out of them.

pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::JobType;

pub use self::store::TrackingStore;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("pipeline execution {0} not found")]
    NotFound(i64),

    #[error("pipeline execution {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: i64,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("pipeline execution {id} already has batch job id '{existing}'")]
    BatchJobIdAlreadySet { id: i64, existing: String },

    #[error("unknown execution status '{0}'")]
    UnknownStatus(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("failed to encode record field: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Lifecycle state of a tracked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Scheduled,
    Submitted,
    Running,
    Completed,
    Crashed,
    Terminated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Scheduled => "SCHEDULED",
            ExecutionStatus::Submitted => "SUBMITTED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Crashed => "CRASHED",
            ExecutionStatus::Terminated => "TERMINATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Crashed | ExecutionStatus::Terminated
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Scheduled, Submitted) => true,
            // The job may report its start before the submit response is recorded.
            (Scheduled, Running) | (Submitted, Running) => true,
            (Running, Completed) => true,
            (from, Crashed) | (from, Terminated) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(ExecutionStatus::Scheduled),
            "SUBMITTED" => Ok(ExecutionStatus::Submitted),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "CRASHED" => Ok(ExecutionStatus::Crashed),
            "TERMINATED" => Ok(ExecutionStatus::Terminated),
            other => Err(TrackingError::UnknownStatus(other.to_string())),
        }
    }
}

/// Fields captured when an execution is first scheduled.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub owner: String,
    pub study_id: i64,
    pub requested_at: DateTime<Utc>,
    pub email_addresses: Vec<String>,
    pub data_start: Option<DateTime<Utc>>,
    pub data_end: Option<DateTime<Utc>>,
    pub participants: Vec<String>,
    pub datastreams: Vec<String>,
    pub job_type: JobType,
    pub box_directory: Option<String>,
}

/// One persisted execution record.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTracking {
    pub id: i64,
    pub owner: String,
    pub study_id: i64,
    pub requested_at: DateTime<Utc>,
    pub email_addresses: Vec<String>,
    pub data_start: Option<DateTime<Utc>>,
    pub data_end: Option<DateTime<Utc>>,
    pub participants: Vec<String>,
    pub datastreams: Vec<String>,
    pub job_type: JobType,
    pub box_directory: Option<String>,
    pub batch_job_id: Option<String>,
    pub status: ExecutionStatus,
    pub error_text: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_minutes: Option<f64>,
}

impl ExecutionTracking {
    /// Minutes between the recorded start and `end`, or zero if the job never
    /// reported a start.
    pub fn minutes_until(&self, end: DateTime<Utc>) -> f64 {
        match self.started_at {
            Some(start) => (end - start).num_seconds().max(0) as f64 / 60.0,
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Scheduled.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Scheduled.can_transition_to(Running));
    }

    #[test]
    fn test_no_skipping_or_regressing() {
        assert!(!Scheduled.can_transition_to(Completed));
        assert!(!Submitted.can_transition_to(Scheduled));
        assert!(!Running.can_transition_to(Submitted));
        assert!(!Submitted.can_transition_to(Submitted));
    }

    #[test]
    fn test_crash_and_terminate_from_any_live_state() {
        for from in [Scheduled, Submitted, Running] {
            assert!(from.can_transition_to(Crashed), "{} -> CRASHED", from);
            assert!(from.can_transition_to(Terminated), "{} -> TERMINATED", from);
        }
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        for from in [Completed, Crashed, Terminated] {
            assert!(from.is_terminal());
            for to in [Scheduled, Submitted, Running, Completed, Crashed, Terminated] {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_status_text_form() {
        assert_eq!("CRASHED".parse::<ExecutionStatus>().unwrap(), Crashed);
        assert_eq!(Terminated.to_string(), "TERMINATED");
        assert!("queued".parse::<ExecutionStatus>().is_err());
    }
}
