//! Remote services the pipeline talks to: the batch compute backend and the
//! secret parameter store.
//!
//! Every operation takes an explicit client handle implementing one of the
//! traits below, so callers (and tests) decide which backend is in use.

pub mod gateway;
pub mod local;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::{BackendMode, BackendSettings};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{service} request failed: {message}")]
    Transport { service: &'static str, message: String },

    #[error("{service} rejected {operation} with status {status}: {body}")]
    Rejected {
        service: &'static str,
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected {service} response: {message}")]
    Decode { service: &'static str, message: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    Injected(String),
}

/// One `name=value` pair in a job's container environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

impl EnvironmentVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Everything the compute backend needs to enqueue one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    pub job_name: String,
    pub job_definition: String,
    pub job_queue: String,
    pub environment: Vec<EnvironmentVariable>,
}

impl JobSpec {
    /// Value of an environment variable by name.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_str())
    }
}

/// Backend acknowledgement of a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmittedJob {
    #[serde(rename = "jobId", default)]
    pub job_id: Option<String>,
    #[serde(rename = "jobName", default)]
    pub job_name: Option<String>,
}

/// Steady-state job operations.
pub trait ComputeBackend: Send + Sync {
    fn submit_job(&self, spec: &JobSpec) -> Result<SubmittedJob, BackendError>;

    fn terminate_job(&self, job_id: &str, reason: &str) -> Result<(), BackendError>;
}

/// Storage class of a published parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    String,
    /// Encrypted at rest by the store.
    SecureString,
}

impl ParameterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterKind::String => "String",
            ParameterKind::SecureString => "SecureString",
        }
    }
}

pub trait ParameterStore: Send + Sync {
    fn put_parameter(
        &self,
        name: &str,
        value: &str,
        kind: ParameterKind,
        overwrite: bool,
    ) -> Result<(), BackendError>;
}

/// Lifecycle of a compute environment as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeEnvironmentStatus {
    Creating,
    Updating,
    Valid,
    Invalid,
    Deleting,
    Deleted,
}

impl FromStr for ComputeEnvironmentStatus {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(Self::Creating),
            "UPDATING" => Ok(Self::Updating),
            "VALID" => Ok(Self::Valid),
            "INVALID" => Ok(Self::Invalid),
            "DELETING" => Ok(Self::Deleting),
            "DELETED" => Ok(Self::Deleted),
            other => Err(BackendError::Decode {
                service: "batch",
                message: format!("unknown compute environment status '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ComputeEnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Updating => "UPDATING",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Managed compute environment to create during setup.
#[derive(Debug, Clone, Serialize)]
pub struct ComputeEnvironmentRequest {
    pub name: String,
    pub service_role: String,
    pub compute_resources: serde_json::Value,
}

/// One-time infrastructure operations used by `pipeline::setup`.
pub trait BatchProvisioner: Send + Sync {
    fn list_compute_environments(&self) -> Result<Vec<String>, BackendError>;

    fn list_job_queues(&self) -> Result<Vec<String>, BackendError>;

    fn list_job_definitions(&self) -> Result<Vec<String>, BackendError>;

    fn create_compute_environment(&self, request: &ComputeEnvironmentRequest) -> Result<(), BackendError>;

    fn compute_environment_status(&self, name: &str) -> Result<ComputeEnvironmentStatus, BackendError>;

    fn create_job_queue(&self, name: &str, compute_environment: &str, priority: u32) -> Result<(), BackendError>;

    fn register_job_definition(
        &self,
        name: &str,
        container_properties: &serde_json::Value,
    ) -> Result<(), BackendError>;
}

/// Client handles shared by the API server and the CLI.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub parameters: Arc<dyn ParameterStore>,
    pub provisioner: Arc<dyn BatchProvisioner>,
}

impl Backends {
    /// Use one object for every role.
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: ComputeBackend + ParameterStore + BatchProvisioner + 'static,
    {
        Self {
            compute: backend.clone(),
            parameters: backend.clone(),
            provisioner: backend,
        }
    }
}

/// Build the configured backend clients.
pub fn connect(settings: &BackendSettings) -> anyhow::Result<Backends> {
    match settings.mode {
        BackendMode::Gateway => {
            tracing::info!(
                batch = %settings.batch_endpoint,
                ssm = %settings.ssm_endpoint,
                "using gateway backend"
            );
            let client = gateway::GatewayClient::new(
                &settings.batch_endpoint,
                &settings.ssm_endpoint,
                std::time::Duration::from_secs(settings.timeout_secs),
            )?;
            Ok(Backends::from_shared(Arc::new(client)))
        }
        BackendMode::Local => {
            tracing::warn!("using in-process local backend; jobs will not run");
            Ok(Backends::from_shared(Arc::new(local::LocalBackend::new())))
        }
    }
}
