//! Dispatches a job to the right optimization algorithm and normalizes the
//! outcome into the job error taxonomy.

use std::sync::Arc;

use async_trait::async_trait;
use opthub_algorithms::AlgorithmError;
use opthub_algorithms::CancelFlag;
use opthub_algorithms::ResolvedParams;
use opthub_algorithms::RunContext;
use opthub_algorithms::find_algorithm;
use opthub_algorithms::find_benchmark;
use opthub_algorithms::knapsack_fitness;
use opthub_algorithms::tsp_fitness;
use opthub_protocol::FitnessSelector;
use opthub_protocol::JobError;
use opthub_protocol::JobRecord;
use opthub_protocol::OptimizationResult;
use opthub_protocol::ProblemDescriptor;
use opthub_protocol::SandboxJobSpec;
use opthub_sandbox::SandboxExecutor;
use tokio_util::sync::CancellationToken;

/// Cooperative cancellation, fanned out to both halves of the runner: the
/// atomic flag kernels poll between iterations and the token the sandbox
/// executor watches.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    pub flag: CancelFlag,
    pub token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.cancel();
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

/// The seam the worker pool drives. Production uses [`AlgorithmRunner`];
/// tests substitute stubs.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        record: &JobRecord,
        cancel: &CancelHandle,
    ) -> Result<OptimizationResult, JobError>;
}

pub struct AlgorithmRunner {
    /// Absent when the sandbox child binary is missing; user-supplied
    /// fitness jobs then fail with a `container` error instead of taking
    /// the whole service down.
    sandbox: Option<Arc<SandboxExecutor>>,
}

impl AlgorithmRunner {
    pub fn new(sandbox: Option<Arc<SandboxExecutor>>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl JobRunner for AlgorithmRunner {
    async fn run(
        &self,
        record: &JobRecord,
        cancel: &CancelHandle,
    ) -> Result<OptimizationResult, JobError> {
        let algorithm = find_algorithm(&record.algorithm).ok_or_else(|| {
            JobError::validation(format!("unknown algorithm: {}", record.algorithm))
        })?;
        let params = ResolvedParams::resolve(algorithm.param_specs(), &record.params)
            .map_err(|err| JobError::validation(err.to_string()))?;
        // Canonicalization forces problem-type bounds and objective; a
        // single pass here means everything downstream sees one shape.
        let problem = record.problem.clone().canonicalized();

        match problem.fitness.clone() {
            FitnessSelector::Benchmark { name } => {
                let benchmark = find_benchmark(&name).ok_or_else(|| {
                    JobError::validation(format!("unknown fitness function: {name}"))
                })?;
                run_kernel(algorithm, problem, params, cancel.flag.clone(), benchmark.eval).await
            }
            FitnessSelector::Tsp { tsp } => {
                let eval = tsp_fitness(&tsp);
                run_kernel(algorithm, problem, params, cancel.flag.clone(), eval).await
            }
            FitnessSelector::Knapsack { knapsack } => {
                let eval = knapsack_fitness(&knapsack);
                run_kernel(algorithm, problem, params, cancel.flag.clone(), eval).await
            }
            FitnessSelector::UserSupplied { source } => {
                let sandbox = self
                    .sandbox
                    .as_ref()
                    .ok_or_else(|| JobError::container("sandbox executor is unavailable"))?;
                let spec = SandboxJobSpec {
                    algorithm: record.algorithm.clone(),
                    params: record.params.clone(),
                    problem: problem.clone(),
                };
                sandbox.execute(&source, spec, &cancel.token).await
            }
        }
    }
}

/// Run a CPU-bound kernel on the blocking pool. The flag is the only
/// channel back into the loop; dropping the returned future does not stop
/// the thread, cancellation does.
async fn run_kernel<F>(
    algorithm: &'static dyn opthub_algorithms::Optimizer,
    problem: ProblemDescriptor,
    params: ResolvedParams,
    flag: CancelFlag,
    mut eval: F,
) -> Result<OptimizationResult, JobError>
where
    F: FnMut(&[f64]) -> f64 + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let ctx = RunContext {
            problem: &problem,
            params: &params,
            cancel: &flag,
            seed: None,
        };
        algorithm.optimize(&ctx, &mut |x| Ok(eval(x)))
    })
    .await;

    match joined {
        Ok(result) => result.map_err(map_algorithm_error),
        Err(join_err) if join_err.is_panic() => {
            Err(JobError::runtime("algorithm kernel panicked"))
        }
        Err(join_err) => Err(JobError::runtime(format!(
            "algorithm kernel aborted: {join_err}"
        ))),
    }
}

fn map_algorithm_error(err: AlgorithmError) -> JobError {
    match err {
        AlgorithmError::Cancelled => JobError::timeout("run cancelled before completion"),
        AlgorithmError::UnknownAlgorithm(_) | AlgorithmError::InvalidParam { .. } => {
            JobError::validation(err.to_string())
        }
        AlgorithmError::Fitness(message) => JobError::runtime(message),
    }
}
