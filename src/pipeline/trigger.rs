//! Rotate-then-submit runs for scheduled frequencies and the manual action.
//!
//! Both entry points run inside an [`ErrorSentry`] tagged with the frequency:
//! a failure for one study is reported and the remaining studies still run.

use thiserror::Error;

use super::config::{ConfigResolver, EnvSource, InvocationContext};
use super::sentry::{CapturedError, ErrorSentry};
use super::submit::{SubmissionOutcome, SubmissionRequest};
use super::{Frequency, Pipeline};
use crate::directory;

/// Owner recorded on executions the scheduler creates.
pub const SCHEDULER_OWNER: &str = "scheduler";

/// Tag key the sentry scope carries.
pub const FREQUENCY_TAG: &str = "pipeline_frequency";

#[derive(Debug)]
pub struct TriggerReport {
    pub freq: Frequency,
    pub attempted: usize,
    pub submitted: Vec<(i64, SubmissionOutcome)>,
}

#[derive(Debug, Error)]
#[error("{failed} error(s) during {freq} pipeline run over {attempted} studies", failed = .errors.len())]
pub struct TriggerError {
    pub freq: Frequency,
    pub attempted: usize,
    pub submitted: Vec<(i64, SubmissionOutcome)>,
    pub errors: Vec<CapturedError>,
}

/// Rotate the credentials of `freq` once, then submit a `run_pipeline` job
/// for every study that has not been deleted.
pub fn trigger<E: EnvSource>(
    pipeline: &Pipeline,
    resolver: &ConfigResolver<E>,
    context: InvocationContext,
    freq: Frequency,
) -> Result<TriggerReport, TriggerError> {
    let mut sentry = ErrorSentry::new([(FREQUENCY_TAG, freq.as_str())]);
    let mut submitted = Vec::new();
    let mut attempted = 0;

    let ready = sentry.capture(|| {
        let config = resolver.resolve_for(context)?;
        pipeline.rotate(&config, freq)?;
        let studies = {
            let conn = pipeline.pool().get()?;
            directory::list_studies(&conn)?
        };
        Ok((config, studies))
    });

    if let Some((config, studies)) = ready {
        attempted = studies.len();
        for study in studies {
            let request = SubmissionRequest::run_pipeline(SCHEDULER_OWNER, study.id);
            if let Some(outcome) = sentry.capture(|| pipeline.submit(&config, freq, &request)) {
                submitted.push((study.id, outcome));
            }
        }
    }

    tracing::info!(
        %freq,
        attempted,
        submitted = submitted.len(),
        failed = sentry.errors().len(),
        "pipeline run finished"
    );

    match sentry.into_result() {
        Ok(()) => Ok(TriggerReport {
            freq,
            attempted,
            submitted,
        }),
        Err(errors) => Err(TriggerError {
            freq,
            attempted,
            submitted,
            errors,
        }),
    }
}

/// The "run manually" action for one study.
///
/// Every error, configuration problems included, goes through a sentry
/// tagged `manually`; the caller only learns that the run failed.
pub fn run_manually<E: EnvSource>(
    pipeline: &Pipeline,
    resolver: &ConfigResolver<E>,
    context: InvocationContext,
    study_id: i64,
    owner: &str,
) -> Result<SubmissionOutcome, Vec<CapturedError>> {
    let freq = Frequency::Manually;
    let study_tag = study_id.to_string();
    let mut sentry = ErrorSentry::new([(FREQUENCY_TAG, freq.as_str()), ("study_id", study_tag.as_str())]);

    let outcome = sentry.capture(|| {
        let config = resolver.resolve_for(context)?;
        pipeline.rotate(&config, freq)?;
        pipeline.submit(&config, freq, &SubmissionRequest::run_pipeline(owner, study_id))
    });

    match outcome {
        Some(outcome) => Ok(outcome),
        None => Err(sentry.into_result().err().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::backend::Backends;
    use crate::tracking::ExecutionStatus;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn env() -> HashMap<String, String> {
        [
            ("job_name", "beiwe-pipeline-{freq}"),
            ("job_defn_name", "beiwe-defn"),
            ("queue_name", "beiwe-queue"),
            ("access_key_ssm_name", "beiwe-access"),
            ("secret_key_ssm_name", "beiwe-secret"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn setup() -> (tempfile::TempDir, Pipeline, Arc<LocalBackend>) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let backend = Arc::new(LocalBackend::new());
        let pipeline = Pipeline::new(pool, Backends::from_shared(backend.clone()));
        (dir, pipeline, backend)
    }

    fn add_study(pipeline: &Pipeline, object_id: &str) -> i64 {
        let conn = pipeline.pool().get().unwrap();
        directory::create_study(&conn, object_id, object_id).unwrap().id
    }

    #[test]
    fn test_trigger_submits_for_every_live_study() {
        let (_dir, pipeline, backend) = setup();
        let a = add_study(&pipeline, "a");
        let b = add_study(&pipeline, "b");
        let gone = add_study(&pipeline, "gone");
        directory::mark_study_deleted(&pipeline.pool().get().unwrap(), gone).unwrap();

        let resolver = ConfigResolver::with_env(None, env());
        let report = trigger(&pipeline, &resolver, InvocationContext::Webserver, Frequency::Weekly).unwrap();

        assert_eq!(report.attempted, 2);
        let studies: Vec<i64> = report.submitted.iter().map(|(s, _)| *s).collect();
        assert_eq!(studies, vec![a, b]);
        assert_eq!(backend.jobs().len(), 2);
        assert!(backend.parameter("beiwe-access-weekly").is_some());
        for (_, outcome) in &report.submitted {
            let job = backend.job(&outcome.batch_job_id).unwrap();
            assert_eq!(job.spec.job_name, "beiwe-pipeline-weekly");
            assert_eq!(job.spec.env("owner_id"), Some(SCHEDULER_OWNER));
        }
    }

    #[test]
    fn test_trigger_collects_every_failure() {
        let (_dir, pipeline, backend) = setup();
        let a = add_study(&pipeline, "a");
        add_study(&pipeline, "b");
        backend.fail_submissions(Some("queue disabled"));

        let resolver = ConfigResolver::with_env(None, env());
        let err = trigger(&pipeline, &resolver, InvocationContext::Webserver, Frequency::Daily).unwrap_err();

        assert_eq!(err.attempted, 2);
        assert_eq!(err.errors.len(), 2);
        assert!(err.submitted.is_empty());
        assert_eq!(pipeline.store().list_for_study(a).unwrap()[0].status, ExecutionStatus::Crashed);
        assert!(err.to_string().starts_with("2 error(s) during daily"));
    }

    #[test]
    fn test_trigger_without_configuration_reports_and_submits_nothing() {
        let (_dir, pipeline, backend) = setup();
        add_study(&pipeline, "a");

        let resolver = ConfigResolver::with_env(None, HashMap::new());
        let err = trigger(&pipeline, &resolver, InvocationContext::Webserver, Frequency::Hourly).unwrap_err();

        assert_eq!(err.attempted, 0);
        assert_eq!(err.errors[0].error.kind(), "configuration");
        assert!(backend.jobs().is_empty());
    }

    #[test]
    fn test_run_manually_success_and_failure() {
        let (_dir, pipeline, backend) = setup();
        let study = add_study(&pipeline, "a");
        let resolver = ConfigResolver::with_env(None, env());

        let outcome = run_manually(&pipeline, &resolver, InvocationContext::Webserver, study, "alice").unwrap();
        assert_eq!(
            backend.job(&outcome.batch_job_id).unwrap().spec.env("FREQ"),
            Some("manually")
        );

        let errors = run_manually(&pipeline, &resolver, InvocationContext::Webserver, 999, "alice").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.kind(), "not_found");
    }
}
