//! In-process backend that records jobs and parameters in memory.
//!
//! Used for development (`backend.mode = "local"`) and as the test double for
//! the pipeline. Failures can be injected per operation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{
    BackendError, BatchProvisioner, ComputeBackend, ComputeEnvironmentRequest, ComputeEnvironmentStatus,
    JobSpec, ParameterKind, ParameterStore, SubmittedJob,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalJobState {
    Submitted,
    Terminated { reason: String },
}

#[derive(Debug, Clone)]
pub struct LocalJob {
    pub id: String,
    pub spec: JobSpec,
    pub state: LocalJobState,
}

#[derive(Debug, Clone)]
pub struct StoredParameter {
    pub value: String,
    pub kind: ParameterKind,
    pub version: u64,
}

#[derive(Default)]
struct LocalState {
    next_job: u64,
    jobs: BTreeMap<String, LocalJob>,
    parameters: BTreeMap<String, StoredParameter>,
    compute_environments: BTreeMap<String, ComputeEnvironmentStatus>,
    job_queues: Vec<String>,
    job_definitions: Vec<String>,
    job_definition_properties: BTreeMap<String, serde_json::Value>,
    fail_submit: Option<String>,
    fail_terminate: Option<String>,
    fail_parameters: Option<String>,
    omit_job_ids: bool,
    pending_status_polls: u32,
}

#[derive(Default)]
pub struct LocalBackend {
    state: Mutex<LocalState>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following `submit_job` fail with `message`.
    pub fn fail_submissions(&self, message: Option<&str>) {
        self.state().fail_submit = message.map(str::to_string);
    }

    pub fn fail_terminations(&self, message: Option<&str>) {
        self.state().fail_terminate = message.map(str::to_string);
    }

    pub fn fail_parameter_writes(&self, message: Option<&str>) {
        self.state().fail_parameters = message.map(str::to_string);
    }

    /// Acknowledge submissions without a job id.
    pub fn omit_job_ids(&self, omit: bool) {
        self.state().omit_job_ids = omit;
    }

    /// Report `CREATING` for the next `polls` status queries of a new
    /// compute environment before it turns `VALID`.
    pub fn delay_compute_environments(&self, polls: u32) {
        self.state().pending_status_polls = polls;
    }

    /// Force a compute environment into a given status.
    pub fn set_compute_environment_status(&self, name: &str, status: ComputeEnvironmentStatus) {
        self.state().compute_environments.insert(name.to_string(), status);
    }

    pub fn add_job_queue(&self, name: &str) {
        self.state().job_queues.push(name.to_string());
    }

    pub fn add_job_definition(&self, name: &str) {
        self.state().job_definitions.push(name.to_string());
    }

    pub fn jobs(&self) -> Vec<LocalJob> {
        self.state().jobs.values().cloned().collect()
    }

    pub fn job(&self, id: &str) -> Option<LocalJob> {
        self.state().jobs.get(id).cloned()
    }

    /// Container properties a job definition was registered with.
    pub fn job_definition(&self, name: &str) -> Option<serde_json::Value> {
        self.state().job_definition_properties.get(name).cloned()
    }

    pub fn parameter(&self, name: &str) -> Option<StoredParameter> {
        self.state().parameters.get(name).cloned()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.state().parameters.keys().cloned().collect()
    }
}

impl ComputeBackend for LocalBackend {
    fn submit_job(&self, spec: &JobSpec) -> Result<SubmittedJob, BackendError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_submit {
            return Err(BackendError::Injected(message.clone()));
        }

        state.next_job += 1;
        let id = format!("local-job-{}", state.next_job);
        state.jobs.insert(
            id.clone(),
            LocalJob {
                id: id.clone(),
                spec: spec.clone(),
                state: LocalJobState::Submitted,
            },
        );
        tracing::info!(job_id = %id, job_name = %spec.job_name, "local job accepted");

        Ok(SubmittedJob {
            job_id: if state.omit_job_ids { None } else { Some(id) },
            job_name: Some(spec.job_name.clone()),
        })
    }

    fn terminate_job(&self, job_id: &str, reason: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_terminate {
            return Err(BackendError::Injected(message.clone()));
        }
        let job = state.jobs.get_mut(job_id).ok_or_else(|| BackendError::NotFound {
            kind: "job",
            name: job_id.to_string(),
        })?;
        job.state = LocalJobState::Terminated {
            reason: reason.to_string(),
        };
        Ok(())
    }
}

impl ParameterStore for LocalBackend {
    fn put_parameter(
        &self,
        name: &str,
        value: &str,
        kind: ParameterKind,
        overwrite: bool,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_parameters {
            return Err(BackendError::Injected(message.clone()));
        }

        let version = match state.parameters.get(name) {
            Some(_) if !overwrite => {
                return Err(BackendError::Rejected {
                    service: "ssm",
                    operation: "PutParameter",
                    status: 400,
                    body: format!("ParameterAlreadyExists: {}", name),
                })
            }
            Some(existing) => existing.version + 1,
            None => 1,
        };
        state.parameters.insert(
            name.to_string(),
            StoredParameter {
                value: value.to_string(),
                kind,
                version,
            },
        );
        Ok(())
    }
}

impl BatchProvisioner for LocalBackend {
    fn list_compute_environments(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state().compute_environments.keys().cloned().collect())
    }

    fn list_job_queues(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state().job_queues.clone())
    }

    fn list_job_definitions(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state().job_definitions.clone())
    }

    fn create_compute_environment(&self, request: &ComputeEnvironmentRequest) -> Result<(), BackendError> {
        let mut state = self.state();
        let initial = if state.pending_status_polls > 0 {
            ComputeEnvironmentStatus::Creating
        } else {
            ComputeEnvironmentStatus::Valid
        };
        state.compute_environments.insert(request.name.clone(), initial);
        Ok(())
    }

    fn compute_environment_status(&self, name: &str) -> Result<ComputeEnvironmentStatus, BackendError> {
        let mut state = self.state();
        let current = *state
            .compute_environments
            .get(name)
            .ok_or_else(|| BackendError::NotFound {
                kind: "compute environment",
                name: name.to_string(),
            })?;

        if current == ComputeEnvironmentStatus::Creating {
            if state.pending_status_polls > 0 {
                state.pending_status_polls -= 1;
            }
            if state.pending_status_polls == 0 {
                state
                    .compute_environments
                    .insert(name.to_string(), ComputeEnvironmentStatus::Valid);
            }
        }
        Ok(current)
    }

    fn create_job_queue(&self, name: &str, _compute_environment: &str, _priority: u32) -> Result<(), BackendError> {
        self.state().job_queues.push(name.to_string());
        Ok(())
    }

    fn register_job_definition(
        &self,
        name: &str,
        container_properties: &serde_json::Value,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        state.job_definitions.push(name.to_string());
        state
            .job_definition_properties
            .insert(name.to_string(), container_properties.clone());
        Ok(())
    }
}
