//! Data pipeline job submission.
//!
//! A caller (web endpoint, CLI or the frequency scheduler) first refreshes the
//! batch user's data access credentials with [`rotation`], then submits one
//! job per study through [`submit`]. Every submission is tracked in
//! [`crate::tracking`]; [`terminate`] stops a tracked job.

pub mod config;
pub mod naming;
pub mod rotation;
pub mod sentry;
pub mod setup;
pub mod submit;
pub mod terminate;
pub mod trigger;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendError, Backends};
use crate::directory::DirectoryError;
use crate::storage::Pool;
use crate::tracking::{TrackingError, TrackingStore};

use self::config::{ConfigError, ResolvedConfig};

/// Textual timestamp format used in job environments.
pub const API_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn format_api_time(dt: DateTime<Utc>) -> String {
    dt.format(API_TIME_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is not configured: {0}")]
    Configuration(#[from] ConfigError),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job submission for pipeline {pipeline_id} failed: {message}")]
    Submission { pipeline_id: i64, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("could not find an unused name for {resource} '{base_name}' after {attempts} attempts")]
    Exhausted {
        resource: String,
        base_name: String,
        attempts: u32,
    },

    #[error("tracking store error: {0}")]
    Tracking(TrackingError),

    #[error("directory error: {0}")]
    Directory(DirectoryError),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("remote service error: {0}")]
    Backend(#[from] BackendError),
}

impl PipelineError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Validation(_) => "validation",
            PipelineError::Submission { .. } => "submission",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Precondition(_) => "precondition",
            PipelineError::Exhausted { .. } => "exhausted",
            PipelineError::Tracking(_) | PipelineError::Directory(_) | PipelineError::Pool(_) => "storage",
            PipelineError::Backend(_) => "backend",
        }
    }
}

impl From<TrackingError> for PipelineError {
    fn from(err: TrackingError) -> Self {
        match err {
            TrackingError::NotFound(id) => PipelineError::NotFound(format!("pipeline execution {}", id)),
            e @ (TrackingError::IllegalTransition { .. } | TrackingError::BatchJobIdAlreadySet { .. }) => {
                PipelineError::Precondition(e.to_string())
            }
            other => PipelineError::Tracking(other),
        }
    }
}

impl From<DirectoryError> for PipelineError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::StudyNotFound(id) => PipelineError::NotFound(format!("study {}", id)),
            DirectoryError::ResearcherNotFound(name) => PipelineError::NotFound(format!("researcher '{}'", name)),
            DirectoryError::Invalid { field, reason } => PipelineError::Validation(format!("{}: {}", field, reason)),
            other => PipelineError::Directory(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline handle
// ---------------------------------------------------------------------------

/// The database pool, tracking store and remote clients every operation
/// needs, passed explicitly instead of living in globals.
#[derive(Clone)]
pub struct Pipeline {
    pool: Pool,
    store: TrackingStore,
    backends: Backends,
}

impl Pipeline {
    pub fn new(pool: Pool, backends: Backends) -> Self {
        Self {
            store: TrackingStore::new(pool.clone()),
            pool,
            backends,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn store(&self) -> &TrackingStore {
        &self.store
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn rotate(&self, config: &ResolvedConfig, freq: Frequency) -> Result<rotation::RotationReport, PipelineError> {
        rotation::rotate(&self.pool, self.backends.parameters.as_ref(), config, freq)
    }

    pub fn submit(
        &self,
        config: &ResolvedConfig,
        freq: Frequency,
        request: &submit::SubmissionRequest,
    ) -> Result<submit::SubmissionOutcome, PipelineError> {
        submit::submit(
            &self.pool,
            &self.store,
            self.backends.compute.as_ref(),
            config,
            freq,
            request,
        )
    }

    pub fn terminate(&self, pipeline_id: i64, requesting_user: &str) -> Result<String, PipelineError> {
        terminate::terminate(&self.store, self.backends.compute.as_ref(), pipeline_id, requesting_user)
    }
}

// ---------------------------------------------------------------------------
// Frequency
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("unknown frequency '{0}' (expected hourly, daily, weekly, monthly or manually)")]
pub struct UnknownFrequency(pub String);

/// Why a job was scheduled. Namespaces the batch user and the parameter
/// names so credentials of different frequencies never overwrite each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Manually,
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Hourly,
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Monthly,
        Frequency::Manually,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Manually => "manually",
        }
    }

    /// Username of the password-less principal jobs of this frequency use.
    pub fn batch_username(&self) -> String {
        format!("BATCH USER {}", self.as_str())
    }

    /// Cron expression (with seconds) the scheduler fires on. `None` for
    /// manual runs.
    pub fn cron_expr(&self) -> Option<&'static str> {
        match self {
            Frequency::Hourly => Some("0 0 * * * *"),
            Frequency::Daily => Some("0 0 0 * * *"),
            Frequency::Weekly => Some("0 0 0 * * Sun"),
            Frequency::Monthly => Some("0 0 0 1 * *"),
            Frequency::Manually => None,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = UnknownFrequency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Frequency::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFrequency(s.to_string()))
    }
}

impl From<UnknownFrequency> for PipelineError {
    fn from(err: UnknownFrequency) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Job type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("unknown job type '{0}' (expected run_pipeline or copy_to_box)")]
pub struct UnknownJobType(pub String);

/// Pipeline function the executing job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    RunPipeline,
    CopyToBox,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::RunPipeline, JobType::CopyToBox];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::RunPipeline => "run_pipeline",
            JobType::CopyToBox => "copy_to_box",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownJobType(s.to_string()))
    }
}

impl From<UnknownJobType> for PipelineError {
    fn from(err: UnknownJobType) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// StringList
// ---------------------------------------------------------------------------

/// A list parameter given either as one delimited string or as a sequence.
///
/// `"a,b,c"`, `"a b c"` and `["a", "b", "c"]` all normalize to the same
/// items; the job environment always carries them space-joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    Single(String),
    Many(Vec<String>),
}

impl Default for StringList {
    fn default() -> Self {
        StringList::Many(Vec::new())
    }
}

impl StringList {
    /// Trimmed, non-empty items in their original order.
    pub fn items(&self) -> Vec<String> {
        match self {
            StringList::Single(s) => s
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            StringList::Many(items) => items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Space-joined form sent to the executing job.
    pub fn to_wire(&self) -> String {
        self.items().join(" ")
    }
}

impl From<&str> for StringList {
    fn from(s: &str) -> Self {
        StringList::Single(s.to_string())
    }
}

impl From<Vec<String>> for StringList {
    fn from(items: Vec<String>) -> Self {
        StringList::Many(items)
    }
}
