//! Submission, poll, cancel, and health handlers, plus the error payload
//! shared by every non-2xx response.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use chrono::Utc;
use opthub_algorithms::ResolvedParams;
use opthub_algorithms::find_algorithm;
use opthub_protocol::ErrorKind;
use opthub_protocol::GroupId;
use opthub_protocol::JobError;
use opthub_protocol::JobId;
use opthub_protocol::JobRecord;
use opthub_protocol::JobState;
use opthub_protocol::OptimizationResult;
use opthub_protocol::ProblemDescriptor;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::AppState;

/// Error envelope: `{detail: {error, error_type, message}}` on every
/// non-2xx response.
///
/// `error_type` is usually a failure-taxonomy kind; the one exception is
/// `already_finished` for cancelling a job that already reached a terminal
/// state, which is a conflict rather than a failure and is never stored on
/// a job record.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    title: &'static str,
    error_type: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: JobError) -> Self {
        Self {
            status,
            title: Self::title(error.kind),
            error_type: error.kind.to_string(),
            message: error.message,
        }
    }

    /// Status derived from the error kind.
    pub fn from_job_error(error: JobError) -> Self {
        let status = match error.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::UnknownJob => StatusCode::NOT_FOUND,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Resource
            | ErrorKind::Container
            | ErrorKind::Parse
            | ErrorKind::Runtime => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error)
    }

    /// Cancel arrived after the job already finished.
    pub fn already_finished(id: JobId, state: JobState) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            title: "task already finished",
            error_type: "already_finished".to_string(),
            message: format!("task {id} already finished as {state}"),
        }
    }

    fn title(kind: ErrorKind) -> &'static str {
        match kind {
            ErrorKind::Validation => "invalid request",
            ErrorKind::Timeout => "execution timed out",
            ErrorKind::Resource => "resource limit exceeded",
            ErrorKind::Container => "sandbox failure",
            ErrorKind::Parse => "unreadable sandbox output",
            ErrorKind::Runtime => "execution failed",
            ErrorKind::UnknownJob => "unknown task",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "detail": {
                "error": self.title,
                "error_type": self.error_type,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    pub problem: ProblemDescriptor,
    pub algorithms: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct OptimizeResponse {
    pub group_id: GroupId,
    pub task_ids: Vec<JobId>,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OptimizationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// `POST /async/optimize` — validate, allocate one job per algorithm under
/// a shared group id, enqueue, and return the handles.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OptimizeRequest>,
) -> Result<Json<OptimizeResponse>, ApiError> {
    if request.algorithms.is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            JobError::validation("at least one algorithm is required"),
        ));
    }
    request
        .problem
        .validate()
        .map_err(|err| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, err))?;

    // Validate every algorithm before creating anything, so a bad name in a
    // multi-algorithm submission rejects the whole request.
    let mut validated = Vec::with_capacity(request.algorithms.len());
    for name in &request.algorithms {
        let algorithm = find_algorithm(name)
            .ok_or_else(|| JobError::validation(format!("unknown algorithm: {name}")))
            .map_err(ApiError::from_job_error)?;
        let params = params_for(algorithm, &request.params).map_err(ApiError::from_job_error)?;
        validated.push((algorithm, params));
    }

    let group_id = GroupId::new();
    let mut task_ids = Vec::with_capacity(validated.len());
    for (algorithm, params) in validated {
        let id = JobId::new();
        let record = JobRecord::pending(
            id,
            group_id,
            algorithm.name(),
            request.problem.clone(),
            params,
            Utc::now(),
        );
        state
            .store
            .create(record)
            .map_err(|err| ApiError::from_job_error(JobError::validation(err.to_string())))?;
        state.pool.submit(id).map_err(|err| {
            // Queue at capacity: report it as such; already-enqueued jobs
            // of this group keep running.
            ApiError::new(StatusCode::TOO_MANY_REQUESTS, err)
        })?;
        task_ids.push(id);
    }

    info!(
        "accepted group {group_id} with {} task(s): {task_ids:?}",
        task_ids.len()
    );
    Ok(Json(OptimizeResponse { group_id, task_ids }))
}

/// `GET /async/tasks/{id}` — single-shot poll.
pub async fn poll(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let id = parse_job_id(&id)?;
    let record = state
        .store
        .get(id)
        .ok_or_else(|| ApiError::from_job_error(JobError::unknown_job(format!("no task {id}"))))?;
    Ok(Json(TaskStatusResponse {
        task_id: record.id,
        state: record.state,
        result: record.result,
        error: record.error,
    }))
}

/// `POST /async/tasks/{id}/cancel` — cooperative cancellation of a running
/// job. The hard-timeout path still applies if the runner ignores it.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let id = parse_job_id(&id)?;
    let record = state
        .store
        .get(id)
        .ok_or_else(|| ApiError::from_job_error(JobError::unknown_job(format!("no task {id}"))))?;
    if record.state.is_terminal() {
        return Err(ApiError::already_finished(id, record.state));
    }
    let delivered = state.pool.cancel(id);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "task_id": id,
            "cancelling": delivered,
        })),
    ))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::from_job_error(JobError::unknown_job(format!("no task {raw}")))
    })
}

/// Reduce the shared submission parameter map to one algorithm's admissible
/// keys and range-check what remains. A multi-algorithm submission shares
/// one map, so keys belonging to other algorithms are dropped rather than
/// rejected; out-of-range values for this algorithm still reject.
fn params_for(
    algorithm: &'static dyn opthub_algorithms::Optimizer,
    shared: &BTreeMap<String, f64>,
) -> Result<BTreeMap<String, f64>, JobError> {
    let specs = algorithm.param_specs();
    let filtered: BTreeMap<String, f64> = shared
        .iter()
        .filter(|(key, _)| specs.iter().any(|spec| spec.key == key.as_str()))
        .map(|(key, value)| (key.clone(), *value))
        .collect();
    ResolvedParams::resolve(specs, &filtered)
        .map_err(|err| JobError::validation(err.to_string()))?;
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use opthub_algorithms::find_algorithm;
    use pretty_assertions::assert_eq;

    use super::params_for;

    #[test]
    fn foreign_keys_are_dropped_own_keys_are_checked() {
        let Some(pso) = find_algorithm("particle_swarm") else {
            panic!("particle_swarm must be registered");
        };
        let shared = BTreeMap::from([
            ("swarm_size".to_string(), 30.0),
            ("population_size".to_string(), 50.0), // belongs to GA/DE
        ]);
        let filtered = match params_for(pso, &shared) {
            Ok(filtered) => filtered,
            Err(err) => panic!("unexpected rejection: {err}"),
        };
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("swarm_size"));

        let bad = BTreeMap::from([("swarm_size".to_string(), 1.0)]);
        assert!(params_for(pso, &bad).is_err());
    }
}
