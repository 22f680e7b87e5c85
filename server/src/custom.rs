//! `POST /api/optimize/custom` — the synchronous sandbox entry.
//!
//! Multipart upload of a fitness source file and a YAML config; the source
//! is statically validated, then executed under full isolation, and the
//! result (or structured error) is returned in the response. Nothing is
//! persisted in the job store.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::Multipart;
use axum::extract::State;
use axum::http::StatusCode;
use opthub_algorithms::ResolvedParams;
use opthub_algorithms::find_algorithm;
use opthub_protocol::FitnessSelector;
use opthub_protocol::JobError;
use opthub_protocol::Objective;
use opthub_protocol::OptimizationResult;
use opthub_protocol::ProblemDescriptor;
use opthub_protocol::SandboxJobSpec;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::AppState;
use crate::api::ApiError;

/// Per-file upload ceiling.
const MAX_FILE_BYTES: usize = 1024 * 1024;

/// YAML config accompanying the fitness upload. The problem block carries
/// no fitness selector; the uploaded file is the fitness.
#[derive(Debug, Deserialize)]
struct CustomConfig {
    algorithm: String,
    #[serde(default)]
    params: BTreeMap<String, f64>,
    problem: CustomProblem,
}

#[derive(Debug, Deserialize)]
struct CustomProblem {
    #[serde(alias = "n", alias = "dimensions")]
    dim: usize,
    bounds: Vec<(f64, f64)>,
    objective: Objective,
}

pub async fn optimize_custom(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<OptimizationResult>, ApiError> {
    let mut fitness_source: Option<String> = None;
    let mut config_raw: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| validation(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        match name.as_str() {
            "fitness_file" => {
                if !file_name.ends_with(".py") {
                    return Err(validation("fitness_file must have a .py suffix"));
                }
                fitness_source = Some(read_text_field(field).await?);
            }
            "config_file" => {
                if !file_name.ends_with(".yaml") && !file_name.ends_with(".yml") {
                    return Err(validation("config_file must have a .yaml or .yml suffix"));
                }
                config_raw = Some(read_text_field(field).await?);
            }
            other => {
                return Err(validation(format!("unexpected multipart field: {other}")));
            }
        }
    }

    let source = fitness_source.ok_or_else(|| validation("fitness_file is required"))?;
    let config_raw = config_raw.ok_or_else(|| validation("config_file is required"))?;

    // Static validation first: no sandbox is launched for rejected code.
    opthub_fitness_policy::validate(&source)
        .map_err(|rejection| validation(rejection.to_string()))?;

    let config: CustomConfig = serde_yaml::from_str(&config_raw)
        .map_err(|err| validation(format!("invalid config: {err}")))?;
    let algorithm = find_algorithm(&config.algorithm)
        .ok_or_else(|| validation(format!("unknown algorithm: {}", config.algorithm)))?;
    ResolvedParams::resolve(algorithm.param_specs(), &config.params)
        .map_err(|err| validation(err.to_string()))?;

    let problem = ProblemDescriptor {
        dim: config.problem.dim,
        bounds: config.problem.bounds,
        objective: config.problem.objective,
        fitness: FitnessSelector::UserSupplied {
            source: source.clone(),
        },
    };
    problem
        .validate()
        .map_err(|err| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, err))?;

    let sandbox = state
        .sandbox
        .as_ref()
        .ok_or_else(|| ApiError::from_job_error(JobError::container("sandbox unavailable")))?;

    info!(
        "running custom fitness with {} over {} dimension(s)",
        algorithm.name(),
        problem.dim
    );
    let spec = SandboxJobSpec {
        algorithm: algorithm.name().to_string(),
        params: config.params,
        problem,
    };
    let result = sandbox
        .execute(&source, spec, &CancellationToken::new())
        .await
        .map_err(ApiError::from_job_error)?;
    Ok(Json(result))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    let text = field
        .text()
        .await
        .map_err(|err| validation(format!("unreadable upload: {err}")))?;
    if text.len() > MAX_FILE_BYTES {
        return Err(validation("uploaded file exceeds the 1 MiB limit"));
    }
    Ok(text)
}

fn validation(message: impl Into<String>) -> ApiError {
    ApiError::from_job_error(JobError::validation(message))
}
