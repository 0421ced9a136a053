use chrono::Utc;

use super::PipelineError;
use crate::backend::ComputeBackend;
use crate::tracking::TrackingStore;

/// Ask the compute backend to stop the job behind `pipeline_id`, then record
/// the termination.
///
/// The record is only touched after the backend accepted the request. A
/// backend error leaves it as it was and is returned unchanged.
pub fn terminate(
    store: &TrackingStore,
    compute: &dyn ComputeBackend,
    pipeline_id: i64,
    requesting_user: &str,
) -> Result<String, PipelineError> {
    let record = store.get(pipeline_id)?;
    let Some(batch_job_id) = record.batch_job_id else {
        return Err(PipelineError::Precondition("batch job id not found".to_string()));
    };
    if record.status.is_terminal() {
        return Err(PipelineError::Precondition(format!(
            "pipeline execution {} is already {}",
            pipeline_id, record.status
        )));
    }

    let reason = format!("terminated by {}", requesting_user);
    compute.terminate_job(&batch_job_id, &reason)?;
    store.mark_terminated(pipeline_id, Utc::now(), &reason)?;

    tracing::info!(pipeline_id, %batch_job_id, %requesting_user, "job terminated");
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::{LocalBackend, LocalJobState};
    use crate::backend::{ComputeBackend, JobSpec};
    use crate::pipeline::JobType;
    use crate::tracking::{ExecutionStatus, NewExecution};

    fn setup() -> (tempfile::TempDir, TrackingStore, i64) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let study_id = {
            let conn = pool.get().unwrap();
            crate::directory::create_study(&conn, "obj", "Study").unwrap().id
        };
        let store = TrackingStore::new(pool);
        let id = store
            .create(&NewExecution {
                owner: "alice".into(),
                study_id,
                requested_at: Utc::now(),
                email_addresses: vec![],
                data_start: None,
                data_end: None,
                participants: vec![],
                datastreams: vec![],
                job_type: JobType::RunPipeline,
                box_directory: None,
            })
            .unwrap();
        (dir, store, id)
    }

    fn submit_to(backend: &LocalBackend, store: &TrackingStore, id: i64) -> String {
        let job = backend
            .submit_job(&JobSpec {
                job_name: "n".into(),
                job_definition: "d".into(),
                job_queue: "q".into(),
                environment: vec![],
            })
            .unwrap();
        let job_id = job.job_id.unwrap();
        store.mark_submitted(id, &job_id).unwrap();
        job_id
    }

    #[test]
    fn test_terminate_submitted_job() {
        let (_dir, store, id) = setup();
        let backend = LocalBackend::new();
        let job_id = submit_to(&backend, &store, id);

        terminate(&store, &backend, id, "bob").unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Terminated);
        assert!(record.error_text.unwrap().contains("bob"));
        assert!(matches!(
            backend.job(&job_id).unwrap().state,
            LocalJobState::Terminated { reason } if reason.contains("bob")
        ));
    }

    #[test]
    fn test_no_batch_id_is_precondition_without_mutation() {
        let (_dir, store, id) = setup();
        let err = terminate(&store, &LocalBackend::new(), id, "bob").unwrap_err();

        assert!(matches!(&err, PipelineError::Precondition(m) if m == "batch job id not found"));
        assert_eq!(store.get(id).unwrap().status, ExecutionStatus::Scheduled);
    }

    #[test]
    fn test_unknown_record_is_not_found() {
        let (_dir, store, _) = setup();
        let err = terminate(&store, &LocalBackend::new(), 4242, "bob").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_backend_failure_leaves_record_unchanged() {
        let (_dir, store, id) = setup();
        let backend = LocalBackend::new();
        submit_to(&backend, &store, id);
        backend.fail_terminations(Some("access denied"));

        let err = terminate(&store, &backend, id, "bob").unwrap_err();
        assert_eq!(err.kind(), "backend");
        assert_eq!(store.get(id).unwrap().status, ExecutionStatus::Submitted);
    }

    #[test]
    fn test_terminal_record_is_not_terminated_again() {
        let (_dir, store, id) = setup();
        let backend = LocalBackend::new();
        submit_to(&backend, &store, id);
        terminate(&store, &backend, id, "bob").unwrap();

        let err = terminate(&store, &backend, id, "carol").unwrap_err();
        assert_eq!(err.kind(), "precondition");
        assert!(store.get(id).unwrap().error_text.unwrap().contains("bob"));
    }
}
