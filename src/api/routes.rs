//! API route definitions.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::pipeline::submit::SubmissionRequest;
use crate::pipeline::{trigger, Frequency, PipelineError};

pub const RUN_MANUAL_SUCCESS: &str = "Data pipeline code successfully initiated!";
pub const RUN_MANUAL_FAILURE: &str = "An unknown error occurred when trying to run this task.";

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/studies/{id}/run-manual", post(run_manual))
        .route("/studies/{id}/pipelines", get(list_for_study))
        .route("/pipelines", post(submit_pipeline))
        .route("/pipelines/{id}", get(get_pipeline))
        .route("/pipelines/{id}/terminate", post(terminate_pipeline))
        .route("/pipelines/{id}/started", post(pipeline_started))
        .route("/pipelines/{id}/completed", post(pipeline_completed))
        .route("/pipelines/{id}/crashed", post(pipeline_crashed))
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok((StatusCode::OK, Json(json!({ "data": data }))))
}

/// Parse a JSON body; an empty body yields `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))
}

/// Run blocking pipeline work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
struct RunManualBody {
    owner: Option<String>,
}

async fn run_manual(State(state): State<AppState>, Path(study_id): Path<i64>, body: Bytes) -> ApiResult {
    let body: RunManualBody = parse_body(&body)?;
    let owner = body.owner.unwrap_or_else(|| "web".to_string());

    let result = tokio::task::spawn_blocking(move || {
        trigger::run_manually(&state.pipeline, &*state.resolver, state.context, study_id, &owner)
    })
    .await?;

    match result {
        Ok(outcome) => Ok((
            StatusCode::OK,
            Json(json!({
                "data": {
                    "pipeline_id": outcome.pipeline_id,
                    "batch_job_id": outcome.batch_job_id,
                },
                "meta": { "message": RUN_MANUAL_SUCCESS }
            })),
        )),
        Err(_) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "pipeline_failed",
            RUN_MANUAL_FAILURE,
        )),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(default)]
    freq: Option<String>,
    #[serde(flatten)]
    request: SubmissionRequest,
}

async fn submit_pipeline(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let body: SubmitBody =
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))?;
    let freq: Frequency = match body.freq.as_deref() {
        Some(f) => f.parse::<Frequency>().map_err(PipelineError::from)?,
        None => Frequency::Manually,
    };

    let outcome = blocking(move || {
        let config = state.resolver.resolve_for(state.context)?;
        state.pipeline.submit(&config, freq, &body.request)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "data": {
                "pipeline_id": outcome.pipeline_id,
                "batch_job_id": outcome.batch_job_id,
                "freq": freq,
            }
        })),
    ))
}

async fn get_pipeline(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let record = blocking(move || Ok(state.pipeline.store().get(id)?)).await?;
    ok(json!(record))
}

async fn list_for_study(State(state): State<AppState>, Path(study_id): Path<i64>) -> ApiResult {
    let records = blocking(move || {
        {
            let conn = state.pipeline.pool().get()?;
            crate::directory::get_study(&conn, study_id)?;
        }
        Ok(state.pipeline.store().list_for_study(study_id)?)
    })
    .await?;
    let total = records.len();
    Ok((
        StatusCode::OK,
        Json(json!({ "data": records, "meta": { "total": total } })),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct TerminateBody {
    requesting_user: Option<String>,
}

async fn terminate_pipeline(State(state): State<AppState>, Path(id): Path<i64>, body: Bytes) -> ApiResult {
    let body: TerminateBody = parse_body(&body)?;
    let user = body
        .requesting_user
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("requesting_user is required"))?;

    let reason = blocking(move || state.pipeline.terminate(id, &user)).await?;
    ok(json!({ "pipeline_id": id, "status": "TERMINATED", "reason": reason }))
}

#[derive(Debug, Default, Deserialize)]
struct CallbackBody {
    at: Option<DateTime<Utc>>,
    reason: Option<String>,
}

async fn pipeline_started(State(state): State<AppState>, Path(id): Path<i64>, body: Bytes) -> ApiResult {
    let body: CallbackBody = parse_body(&body)?;
    let at = body.at.unwrap_or_else(Utc::now);
    blocking(move || Ok(state.pipeline.store().mark_started(id, at)?)).await?;
    ok(json!({ "pipeline_id": id, "status": "RUNNING" }))
}

async fn pipeline_completed(State(state): State<AppState>, Path(id): Path<i64>, body: Bytes) -> ApiResult {
    let body: CallbackBody = parse_body(&body)?;
    let at = body.at.unwrap_or_else(Utc::now);
    blocking(move || Ok(state.pipeline.store().mark_completed(id, at)?)).await?;
    ok(json!({ "pipeline_id": id, "status": "COMPLETED" }))
}

async fn pipeline_crashed(State(state): State<AppState>, Path(id): Path<i64>, body: Bytes) -> ApiResult {
    let body: CallbackBody = parse_body(&body)?;
    let at = body.at.unwrap_or_else(Utc::now);
    let reason = body
        .reason
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("reason is required"))?;
    blocking(move || Ok(state.pipeline.store().mark_crashed(id, at, &reason)?)).await?;
    ok(json!({ "pipeline_id": id, "status": "CRASHED" }))
}
