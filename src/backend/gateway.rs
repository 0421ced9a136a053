//! JSON-over-HTTP client for the batch and parameter store gateways.
//!
//! Request bodies follow the AWS Batch REST API and the SSM JSON 1.1
//! protocol. Authentication and request signing are handled by the gateway
//! the endpoints point at.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    BackendError, BatchProvisioner, ComputeBackend, ComputeEnvironmentRequest, ComputeEnvironmentStatus,
    EnvironmentVariable, JobSpec, ParameterKind, ParameterStore, SubmittedJob,
};

const BATCH: &str = "batch";
const SSM: &str = "ssm";

pub struct GatewayClient {
    http: Client,
    batch_endpoint: String,
    ssm_endpoint: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest<'a> {
    job_name: &'a str,
    job_definition: &'a str,
    job_queue: &'a str,
    container_overrides: ContainerOverrides<'a>,
}

#[derive(Debug, Serialize)]
struct ContainerOverrides<'a> {
    environment: &'a [EnvironmentVariable],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PutParameterRequest<'a> {
    name: &'a str,
    value: &'a str,
    #[serde(rename = "Type")]
    kind: &'static str,
    overwrite: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeEnvironmentDetail {
    compute_environment_name: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeComputeEnvironments {
    #[serde(default)]
    compute_environments: Vec<ComputeEnvironmentDetail>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobQueueDetail {
    job_queue_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeJobQueues {
    #[serde(default)]
    job_queues: Vec<JobQueueDetail>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDefinitionDetail {
    job_definition_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeJobDefinitions {
    #[serde(default)]
    job_definitions: Vec<JobDefinitionDetail>,
    #[serde(default)]
    next_token: Option<String>,
}

impl GatewayClient {
    pub fn new(batch_endpoint: &str, ssm_endpoint: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("beiwe-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            batch_endpoint: batch_endpoint.trim_end_matches('/').to_string(),
            ssm_endpoint: ssm_endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn batch_call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        body: &impl Serialize,
    ) -> Result<T, BackendError> {
        let url = format!("{}/v1/{}", self.batch_endpoint, operation);
        tracing::debug!(%url, "batch request");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| transport(BATCH, e))?;
        decode(BATCH, operation, response)
    }
}

fn transport(service: &'static str, err: reqwest::Error) -> BackendError {
    BackendError::Transport {
        service,
        message: err.to_string(),
    }
}

fn decode<T: DeserializeOwned>(
    service: &'static str,
    operation: &'static str,
    response: reqwest::blocking::Response,
) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(BackendError::Rejected {
            service,
            operation,
            status: status.as_u16(),
            body,
        });
    }
    response.json::<T>().map_err(|e| BackendError::Decode {
        service,
        message: e.to_string(),
    })
}

impl ComputeBackend for GatewayClient {
    fn submit_job(&self, spec: &JobSpec) -> Result<SubmittedJob, BackendError> {
        let body = SubmitJobRequest {
            job_name: &spec.job_name,
            job_definition: &spec.job_definition,
            job_queue: &spec.job_queue,
            container_overrides: ContainerOverrides {
                environment: &spec.environment,
            },
        };
        self.batch_call("submitjob", &body)
    }

    fn terminate_job(&self, job_id: &str, reason: &str) -> Result<(), BackendError> {
        let _: serde_json::Value = self.batch_call("terminatejob", &json!({ "jobId": job_id, "reason": reason }))?;
        Ok(())
    }
}

impl ParameterStore for GatewayClient {
    fn put_parameter(
        &self,
        name: &str,
        value: &str,
        kind: ParameterKind,
        overwrite: bool,
    ) -> Result<(), BackendError> {
        let body = PutParameterRequest {
            name,
            value,
            kind: kind.as_str(),
            overwrite,
        };
        let response = self
            .http
            .post(format!("{}/", self.ssm_endpoint))
            .header("X-Amz-Target", "AmazonSSM.PutParameter")
            .header("Content-Type", "application/x-amz-json-1.1")
            .body(serde_json::to_vec(&body).map_err(|e| BackendError::Decode {
                service: SSM,
                message: e.to_string(),
            })?)
            .send()
            .map_err(|e| transport(SSM, e))?;
        let _: serde_json::Value = decode(SSM, "PutParameter", response)?;
        Ok(())
    }
}

/// Follow `nextToken` until the listing is exhausted. `fetch` receives the
/// token of the page to load and returns that page's names and next token.
fn collect_pages<F>(mut fetch: F) -> Result<Vec<String>, BackendError>
where
    F: FnMut(Option<&str>) -> Result<(Vec<String>, Option<String>), BackendError>,
{
    let mut names = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let (page, next) = fetch(token.as_deref())?;
        names.extend(page);
        match next {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(names),
        }
    }
}

fn page_body(token: Option<&str>) -> serde_json::Value {
    match token {
        Some(token) => json!({ "nextToken": token }),
        None => json!({}),
    }
}

impl BatchProvisioner for GatewayClient {
    fn list_compute_environments(&self) -> Result<Vec<String>, BackendError> {
        collect_pages(|token| {
            let resp: DescribeComputeEnvironments = self.batch_call("describecomputeenvironments", &page_body(token))?;
            let names = resp
                .compute_environments
                .into_iter()
                .filter_map(|c| c.compute_environment_name)
                .collect();
            Ok((names, resp.next_token))
        })
    }

    fn list_job_queues(&self) -> Result<Vec<String>, BackendError> {
        collect_pages(|token| {
            let resp: DescribeJobQueues = self.batch_call("describejobqueues", &page_body(token))?;
            let names = resp.job_queues.into_iter().filter_map(|q| q.job_queue_name).collect();
            Ok((names, resp.next_token))
        })
    }

    fn list_job_definitions(&self) -> Result<Vec<String>, BackendError> {
        collect_pages(|token| {
            let resp: DescribeJobDefinitions = self.batch_call("describejobdefinitions", &page_body(token))?;
            let names = resp
                .job_definitions
                .into_iter()
                .filter_map(|d| d.job_definition_name)
                .collect();
            Ok((names, resp.next_token))
        })
    }

    fn create_compute_environment(&self, request: &ComputeEnvironmentRequest) -> Result<(), BackendError> {
        let body = json!({
            "computeEnvironmentName": request.name,
            "type": "MANAGED",
            "computeResources": request.compute_resources,
            "serviceRole": request.service_role,
        });
        let _: serde_json::Value = self.batch_call("createcomputeenvironment", &body)?;
        Ok(())
    }

    fn compute_environment_status(&self, name: &str) -> Result<ComputeEnvironmentStatus, BackendError> {
        let resp: DescribeComputeEnvironments =
            self.batch_call("describecomputeenvironments", &json!({ "computeEnvironments": [name] }))?;
        let status = resp
            .compute_environments
            .into_iter()
            .next()
            .and_then(|c| c.status)
            .ok_or_else(|| BackendError::NotFound {
                kind: "compute environment",
                name: name.to_string(),
            })?;
        status.parse()
    }

    fn create_job_queue(&self, name: &str, compute_environment: &str, priority: u32) -> Result<(), BackendError> {
        let body = json!({
            "jobQueueName": name,
            "priority": priority,
            "computeEnvironmentOrder": [{ "order": 0, "computeEnvironment": compute_environment }],
        });
        let _: serde_json::Value = self.batch_call("createjobqueue", &body)?;
        Ok(())
    }

    fn register_job_definition(
        &self,
        name: &str,
        container_properties: &serde_json::Value,
    ) -> Result<(), BackendError> {
        let body = json!({
            "jobDefinitionName": name,
            "type": "container",
            "containerProperties": container_properties,
        });
        let _: serde_json::Value = self.batch_call("registerjobdefinition", &body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_body_uses_batch_field_names() {
        let env = vec![EnvironmentVariable::new("FREQ", "manually")];
        let body = SubmitJobRequest {
            job_name: "beiwe-manually",
            job_definition: "defn",
            job_queue: "queue",
            container_overrides: ContainerOverrides { environment: &env },
        };
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["jobName"], "beiwe-manually");
        assert_eq!(value["jobDefinition"], "defn");
        assert_eq!(value["jobQueue"], "queue");
        assert_eq!(value["containerOverrides"]["environment"][0]["name"], "FREQ");
        assert_eq!(value["containerOverrides"]["environment"][0]["value"], "manually");
    }

    #[test]
    fn test_put_parameter_body_shape() {
        let body = PutParameterRequest {
            name: "access-daily",
            value: "AK",
            kind: ParameterKind::SecureString.as_str(),
            overwrite: true,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["Name"], "access-daily");
        assert_eq!(value["Type"], "SecureString");
        assert_eq!(value["Overwrite"], true);
    }

    #[test]
    fn test_listing_follows_next_token() {
        let pages = [
            (None, vec!["beiwe-queue"], Some("t1")),
            (Some("t1"), vec!["beiwe-queue_2"], Some("t2")),
            (Some("t2"), vec!["beiwe-queue_3"], None),
        ];
        let mut calls = 0;
        let names = collect_pages(|token| {
            let (expected, names, next) = &pages[calls];
            assert_eq!(token, *expected);
            calls += 1;
            Ok((names.iter().map(|n| n.to_string()).collect(), next.map(str::to_string)))
        })
        .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(names, vec!["beiwe-queue", "beiwe-queue_2", "beiwe-queue_3"]);
    }

    #[test]
    fn test_describe_response_carries_next_token() {
        let resp: DescribeJobQueues =
            serde_json::from_str(r#"{"jobQueues": [{"jobQueueName": "q"}], "nextToken": "abc"}"#).unwrap();
        assert_eq!(resp.next_token.as_deref(), Some("abc"));
        assert_eq!(page_body(Some("abc"))["nextToken"], "abc");
        assert_eq!(page_body(None), json!({}));
    }

    #[test]
    fn test_endpoints_are_normalized() {
        let client = GatewayClient::new("http://batch.local/", "http://ssm.local//", Duration::from_secs(5)).unwrap();
        assert_eq!(client.batch_endpoint, "http://batch.local");
        assert_eq!(client.ssm_endpoint, "http://ssm.local");
    }
}
