use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Outcome of one completed optimization run, as produced by the algorithm
/// kernels and echoed to clients on SUCCESS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Best point found, one value per problem dimension.
    pub best_solution: Vec<f64>,
    pub best_fitness: f64,
    /// Per-iteration best-so-far fitness; monotone under the objective.
    pub convergence_curve: Vec<f64>,
    pub iterations_completed: u32,
    /// Wall-clock seconds spent inside the kernel.
    pub execution_time: f64,
    /// The parameter map the run actually used, defaults filled in.
    pub params: BTreeMap<String, f64>,
    /// Human-readable algorithm name, e.g. "Particle Swarm Optimization".
    pub algorithm_display_name: String,
}
