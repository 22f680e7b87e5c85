//! Metaheuristic optimization kernels.
//!
//! Every algorithm implements [`Optimizer`] and is reachable only through
//! the declarative [`registry`] (name -> static singleton); nothing here is
//! discovered reflectively. Kernels are synchronous CPU-bound loops that
//! poll a [`CancelFlag`] between iterations so soft timeouts and explicit
//! cancellation take effect without killing the host thread.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use opthub_protocol::OptimizationResult;
use opthub_protocol::ProblemDescriptor;

mod ant_colony;
mod benchmarks;
mod differential_evolution;
mod genetic;
mod params;
mod problem_fitness;
mod pso;
mod simulated_annealing;

pub use benchmarks::Benchmark;
pub use benchmarks::find_benchmark;
pub use params::ParamSpec;
pub use params::ResolvedParams;
pub use problem_fitness::knapsack_fitness;
pub use problem_fitness::tsp_fitness;

#[derive(Debug, thiserror::Error)]
pub enum AlgorithmError {
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("invalid parameter {key}: {reason}")]
    InvalidParam { key: String, reason: String },
    #[error("fitness evaluation failed: {0}")]
    Fitness(String),
    #[error("run cancelled before completion")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AlgorithmError>;

/// Scalar fitness callable handed to a kernel. Implementations may fail
/// (user code raising, sandbox trouble); kernels propagate the first error.
/// Deliberately not `Send`: a kernel runs on one thread, and the sandbox
/// child's interpreter-backed fitness closures are thread-local.
pub type FitnessFn<'a> = dyn FnMut(&[f64]) -> Result<f64> + 'a;

/// Cooperative cancellation flag. Cheap to clone; kernels check it once per
/// iteration, so cancellation latency is bounded by one iteration of work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Inputs common to every kernel invocation.
pub struct RunContext<'a> {
    pub problem: &'a ProblemDescriptor,
    pub params: &'a ResolvedParams,
    pub cancel: &'a CancelFlag,
    /// Fixed RNG seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

/// The uniform contract every optimization algorithm exposes.
pub trait Optimizer: Send + Sync {
    /// Catalog name, e.g. `particle_swarm`.
    fn name(&self) -> &'static str;

    /// Human-readable name echoed in result records.
    fn display_name(&self) -> &'static str;

    /// Admissible parameters with ranges and defaults.
    fn param_specs(&self) -> &'static [ParamSpec];

    /// Run one optimization to completion or cancellation.
    fn optimize(
        &self,
        ctx: &RunContext<'_>,
        fitness: &mut FitnessFn<'_>,
    ) -> Result<OptimizationResult>;
}

static PARTICLE_SWARM: pso::ParticleSwarm = pso::ParticleSwarm;
static GENETIC_ALGORITHM: genetic::GeneticAlgorithm = genetic::GeneticAlgorithm;
static DIFFERENTIAL_EVOLUTION: differential_evolution::DifferentialEvolution =
    differential_evolution::DifferentialEvolution;
static SIMULATED_ANNEALING: simulated_annealing::SimulatedAnnealing =
    simulated_annealing::SimulatedAnnealing;
static ANT_COLONY: ant_colony::AntColony = ant_colony::AntColony;

static REGISTRY: [&dyn Optimizer; 5] = [
    &PARTICLE_SWARM,
    &GENETIC_ALGORITHM,
    &DIFFERENTIAL_EVOLUTION,
    &SIMULATED_ANNEALING,
    &ANT_COLONY,
];

/// The closed algorithm catalog.
pub fn registry() -> &'static [&'static dyn Optimizer] {
    &REGISTRY
}

pub fn find_algorithm(name: &str) -> Option<&'static dyn Optimizer> {
    registry()
        .iter()
        .copied()
        .find(|algorithm| algorithm.name() == name)
}

pub(crate) fn clamp_to_bounds(point: &mut [f64], bounds: &[(f64, f64)]) {
    for (value, (lo, hi)) in point.iter_mut().zip(bounds) {
        *value = value.clamp(*lo, *hi);
    }
}

pub(crate) fn random_point(rng: &mut impl rand::Rng, bounds: &[(f64, f64)]) -> Vec<f64> {
    bounds
        .iter()
        .map(|(lo, hi)| {
            if lo < hi {
                rng.random_range(*lo..*hi)
            } else {
                *lo
            }
        })
        .collect()
}

pub(crate) fn seeded_rng(ctx: &RunContext<'_>) -> rand::rngs::StdRng {
    use rand::SeedableRng;
    match ctx.seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_os_rng(),
    }
}

pub(crate) fn build_result(
    display_name: &str,
    best_solution: Vec<f64>,
    best_fitness: f64,
    convergence_curve: Vec<f64>,
    started: std::time::Instant,
    params: &ResolvedParams,
) -> OptimizationResult {
    OptimizationResult {
        best_solution,
        best_fitness,
        iterations_completed: convergence_curve.len() as u32,
        convergence_curve,
        execution_time: started.elapsed().as_secs_f64(),
        params: params.as_map().clone(),
        algorithm_display_name: display_name.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use opthub_protocol::FitnessSelector;
    use opthub_protocol::Objective;
    use opthub_protocol::ProblemDescriptor;

    pub(crate) fn benchmark_problem(dim: usize, objective: Objective) -> ProblemDescriptor {
        ProblemDescriptor {
            dim,
            bounds: vec![(-5.0, 5.0); dim],
            objective,
            fitness: FitnessSelector::Benchmark {
                name: "sphere".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::CancelFlag;
    use super::find_algorithm;
    use super::registry;

    #[test]
    fn registry_covers_the_catalog() {
        let names: Vec<&str> = registry().iter().map(|a| a.name()).collect();
        assert_eq!(
            names,
            vec![
                "particle_swarm",
                "genetic_algorithm",
                "differential_evolution",
                "simulated_annealing",
                "ant_colony",
            ]
        );
    }

    #[test]
    fn lookup_is_exact() {
        assert!(find_algorithm("particle_swarm").is_some());
        assert!(find_algorithm("Particle_Swarm").is_none());
        assert!(find_algorithm("pso").is_none());
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
