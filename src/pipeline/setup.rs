//! One-time batch infrastructure bring-up.
//!
//! Creates a managed compute environment, a job queue on it, and the job
//! definition submissions use as a template. Every name goes through
//! [`find_free_name_for`] so the flow can be re-run against an account that
//! already holds an earlier setup.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use super::config::{
    ResolvedConfig, ACCESS_KEY_SSM_NAME, COMP_ENV_NAME, COMP_ENV_ROLE, INSTANCE_PROFILE, JOB_DEFN_NAME,
    QUEUE_NAME, REGION_NAME, SECRET_KEY_SSM_NAME, SECURITY_GROUP, SERVER_URL,
};
use super::naming::find_free_name_for;
use crate::backend::{BatchProvisioner, ComputeEnvironmentRequest, ComputeEnvironmentStatus};
use crate::settings::SetupSettings;

pub const COMPUTE_ENVIRONMENT_FILE: &str = "compute-environment.json";
pub const CONTAINER_PROPS_FILE: &str = "container-props.json";

const JOB_QUEUE_PRIORITY: u32 = 1;

/// Bounded polling for operations that settle asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

impl From<&SetupSettings> for RetryPolicy {
    fn from(settings: &SetupSettings) -> Self {
        Self::new(settings.max_attempts, Duration::from_millis(settings.delay_ms))
    }
}

/// Inputs that do not come from the object names configuration.
#[derive(Debug, Clone)]
pub struct ProvisionInputs {
    pub compute_resources: Value,
    pub container_properties: Value,
    pub repo_uri: String,
    pub ami_id: String,
    /// Region used when the object names do not carry `region_name`.
    pub default_region: Option<String>,
}

impl ProvisionInputs {
    /// Read the compute resource and container property templates from
    /// `configs_dir`.
    pub fn load(configs_dir: &Path, repo_uri: &str, ami_id: &str) -> Result<Self> {
        Ok(Self {
            compute_resources: read_json(&configs_dir.join(COMPUTE_ENVIRONMENT_FILE))?,
            container_properties: read_json(&configs_dir.join(CONTAINER_PROPS_FILE))?,
            repo_uri: repo_uri.to_string(),
            ami_id: ami_id.to_string(),
            default_region: None,
        })
    }

    pub fn with_default_region(mut self, region: Option<String>) -> Self {
        self.default_region = region;
        self
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    if !value.is_object() {
        bail!("{} must contain a JSON object", path.display());
    }
    Ok(value)
}

/// Names the server has to be configured with afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub comp_env_name: String,
    pub queue_name: String,
    pub job_defn_name: String,
}

pub fn provision(
    provisioner: &dyn BatchProvisioner,
    config: &ResolvedConfig,
    inputs: ProvisionInputs,
    retry: RetryPolicy,
) -> Result<ProvisionReport> {
    let ProvisionInputs {
        mut compute_resources,
        mut container_properties,
        repo_uri,
        ami_id,
        default_region,
    } = inputs;

    if compute_resources.get("subnets").is_none() {
        bail!(
            "{} has no \"subnets\" entry; list the subnets the compute servers should use",
            COMPUTE_ENVIRONMENT_FILE
        );
    }
    let security_group = config.require(SECURITY_GROUP)?;
    let instance_profile = config.require(INSTANCE_PROFILE)?;
    set_field(&mut compute_resources, "imageId", json!(ami_id))?;
    set_field(&mut compute_resources, "securityGroupIds", json!([security_group]))?;
    set_field(&mut compute_resources, "instanceRole", json!(instance_profile))?;

    // Compute environment
    let existing = provisioner
        .list_compute_environments()
        .context("failed to list compute environments")?;
    let comp_env_name = find_free_name_for("compute environment", config.require(COMP_ENV_NAME)?, &existing)?;

    tracing::info!(name = %comp_env_name, "creating compute environment");
    provisioner.create_compute_environment(&ComputeEnvironmentRequest {
        name: comp_env_name.clone(),
        service_role: config.require(COMP_ENV_ROLE)?.to_string(),
        compute_resources,
    })?;
    wait_until_valid(provisioner, &comp_env_name, retry)?;

    // Job queue
    let existing = provisioner.list_job_queues().context("failed to list job queues")?;
    let queue_name = find_free_name_for("job queue", config.require(QUEUE_NAME)?, &existing)?;

    tracing::info!(name = %queue_name, compute_environment = %comp_env_name, "creating job queue");
    provisioner.create_job_queue(&queue_name, &comp_env_name, JOB_QUEUE_PRIORITY)?;

    // Job definition
    let access_key_ssm_name = config.require(ACCESS_KEY_SSM_NAME)?;
    let secret_key_ssm_name = config.require(SECRET_KEY_SSM_NAME)?;
    let region_name = match config.get(REGION_NAME).or(default_region.as_deref()) {
        Some(region) => region,
        None => {
            tracing::warn!("no region_name configured; job definition gets an empty region");
            ""
        }
    };
    let mut environment = vec![
        json!({"name": ACCESS_KEY_SSM_NAME, "value": access_key_ssm_name}),
        json!({"name": SECRET_KEY_SSM_NAME, "value": secret_key_ssm_name}),
        json!({"name": REGION_NAME, "value": region_name}),
    ];
    if let Some(server_url) = config.get(SERVER_URL) {
        environment.push(json!({"name": SERVER_URL, "value": server_url}));
    }
    set_field(&mut container_properties, "image", json!(repo_uri))?;
    set_field(&mut container_properties, "environment", Value::Array(environment))?;

    let existing = provisioner
        .list_job_definitions()
        .context("failed to list job definitions")?;
    let job_defn_name = find_free_name_for("job definition", config.require(JOB_DEFN_NAME)?, &existing)?;

    tracing::info!(name = %job_defn_name, image = %repo_uri, "registering job definition");
    provisioner.register_job_definition(&job_defn_name, &container_properties)?;

    Ok(ProvisionReport {
        comp_env_name,
        queue_name,
        job_defn_name,
    })
}

fn set_field(target: &mut Value, key: &str, value: Value) -> Result<()> {
    match target.as_object_mut() {
        Some(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        None => bail!("cannot set '{}' on a non-object template", key),
    }
}

fn wait_until_valid(provisioner: &dyn BatchProvisioner, name: &str, retry: RetryPolicy) -> Result<()> {
    for attempt in 1..=retry.max_attempts {
        let status = provisioner
            .compute_environment_status(name)
            .with_context(|| format!("failed to describe compute environment '{}'", name))?;

        match status {
            ComputeEnvironmentStatus::Valid => {
                tracing::info!(%name, attempt, "compute environment is valid");
                return Ok(());
            }
            ComputeEnvironmentStatus::Creating | ComputeEnvironmentStatus::Updating => {
                tracing::debug!(%name, attempt, %status, "waiting for compute environment");
                if attempt < retry.max_attempts {
                    std::thread::sleep(retry.delay);
                }
            }
            other => bail!("compute environment '{}' is {}", name, other),
        }
    }
    bail!(
        "compute environment '{}' did not become VALID after {} attempts",
        name,
        retry.max_attempts
    )
}
