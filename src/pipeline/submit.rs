//! Job submission: record first, then call the compute backend.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::config::{ResolvedConfig, JOB_DEFN_NAME, QUEUE_NAME};
use super::{format_api_time, Frequency, JobType, PipelineError, StringList};
use crate::backend::{ComputeBackend, EnvironmentVariable, JobSpec};
use crate::directory::{self, Study};
use crate::storage::Pool;
use crate::tracking::{NewExecution, TrackingStore};

/// Reason recorded when the backend acknowledges a job without an id.
pub const MISSING_JOB_ID_REASON: &str = "compute backend returned no job identifier";

/// Parameters of one submission as received from a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    pub owner: String,
    pub study_id: i64,
    pub job_type: String,
    #[serde(default)]
    pub email_addresses: StringList,
    #[serde(default)]
    pub data_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participants: StringList,
    #[serde(default)]
    pub datastreams: StringList,
    #[serde(default)]
    pub box_directory: Option<String>,
}

impl SubmissionRequest {
    /// A whole-study `run_pipeline` request with no filters.
    pub fn run_pipeline(owner: impl Into<String>, study_id: i64) -> Self {
        Self {
            owner: owner.into(),
            study_id,
            job_type: JobType::RunPipeline.as_str().to_string(),
            email_addresses: StringList::default(),
            data_start: None,
            data_end: None,
            participants: StringList::default(),
            datastreams: StringList::default(),
            box_directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub pipeline_id: i64,
    pub batch_job_id: String,
}

struct JobTarget {
    job_name: String,
    job_definition: String,
    job_queue: String,
}

/// Submit one job for `request.study_id` at frequency `freq`.
///
/// Validation, configuration and study lookup happen before anything is
/// written. Once the tracking record exists, every outcome is reflected on
/// it: `SUBMITTED` with the batch job id, or `CRASHED` with the error text.
pub fn submit(
    pool: &Pool,
    store: &TrackingStore,
    compute: &dyn ComputeBackend,
    config: &ResolvedConfig,
    freq: Frequency,
    request: &SubmissionRequest,
) -> Result<SubmissionOutcome, PipelineError> {
    let job_type: JobType = request.job_type.parse()?;
    let owner = request.owner.trim();
    if owner.is_empty() {
        return Err(PipelineError::Validation("owner must not be empty".to_string()));
    }
    if let (Some(start), Some(end)) = (request.data_start, request.data_end) {
        if start > end {
            return Err(PipelineError::Validation(format!(
                "data_start {} is after data_end {}",
                format_api_time(start),
                format_api_time(end)
            )));
        }
    }

    let target = JobTarget {
        job_name: config.job_name(freq)?,
        job_definition: config.require(JOB_DEFN_NAME)?.to_string(),
        job_queue: config.require(QUEUE_NAME)?.to_string(),
    };

    let study = {
        let conn = pool.get()?;
        directory::get_study(&conn, request.study_id)?
    };
    if study.deleted {
        return Err(PipelineError::NotFound(format!("study {}", study.id)));
    }

    let new = NewExecution {
        owner: owner.to_string(),
        study_id: study.id,
        requested_at: Utc::now(),
        email_addresses: request.email_addresses.items(),
        data_start: request.data_start,
        data_end: request.data_end,
        participants: request.participants.items(),
        datastreams: request.datastreams.items(),
        job_type,
        box_directory: request.box_directory.clone(),
    };
    let pipeline_id = store.create(&new)?;

    let spec = build_job_spec(&target, &study, freq, pipeline_id, &new, request);

    match compute.submit_job(&spec) {
        Ok(submitted) => match submitted.job_id {
            Some(batch_job_id) => {
                if let Err(e) = store.mark_submitted(pipeline_id, &batch_job_id) {
                    tracing::error!(
                        pipeline_id,
                        %batch_job_id,
                        error = %e,
                        "job submitted but batch job id could not be recorded"
                    );
                }
                tracing::info!(pipeline_id, study_id = study.id, %freq, %job_type, %batch_job_id, "job submitted");
                Ok(SubmissionOutcome {
                    pipeline_id,
                    batch_job_id,
                })
            }
            None => Err(crash(store, pipeline_id, MISSING_JOB_ID_REASON.to_string())),
        },
        Err(e) => Err(crash(store, pipeline_id, e.to_string())),
    }
}

fn crash(store: &TrackingStore, pipeline_id: i64, message: String) -> PipelineError {
    tracing::error!(pipeline_id, error = %message, "job submission failed");
    if let Err(e) = store.mark_crashed(pipeline_id, Utc::now(), &message) {
        tracing::error!(pipeline_id, error = %e, "could not mark execution crashed");
    }
    PipelineError::Submission {
        pipeline_id,
        message,
    }
}

fn build_job_spec(
    target: &JobTarget,
    study: &Study,
    freq: Frequency,
    pipeline_id: i64,
    new: &NewExecution,
    request: &SubmissionRequest,
) -> JobSpec {
    let optional_time = |dt: Option<DateTime<Utc>>| dt.map(format_api_time).unwrap_or_default();

    let environment = vec![
        EnvironmentVariable::new("owner_id", new.owner.as_str()),
        EnvironmentVariable::new("request_datetime", format_api_time(new.requested_at)),
        EnvironmentVariable::new("pipeline_function", new.job_type.as_str()),
        EnvironmentVariable::new("pipeline_id", pipeline_id.to_string()),
        EnvironmentVariable::new("study_object_id", study.object_id.as_str()),
        EnvironmentVariable::new("FREQ", freq.as_str()),
        EnvironmentVariable::new("destination_email_address", request.email_addresses.to_wire()),
        EnvironmentVariable::new("data_start_datetime", optional_time(new.data_start)),
        EnvironmentVariable::new("data_end_datetime", optional_time(new.data_end)),
        EnvironmentVariable::new("participants", request.participants.to_wire()),
        EnvironmentVariable::new("datastreams", request.datastreams.to_wire()),
        EnvironmentVariable::new("box_directory", new.box_directory.clone().unwrap_or_default()),
    ];

    JobSpec {
        job_name: target.job_name.clone(),
        job_definition: target.job_definition.clone(),
        job_queue: target.job_queue.clone(),
        environment,
    }
}
