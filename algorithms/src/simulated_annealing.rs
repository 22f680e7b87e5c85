use std::time::Instant;

use opthub_protocol::OptimizationResult;
use rand::Rng;

use crate::AlgorithmError;
use crate::FitnessFn;
use crate::Optimizer;
use crate::ParamSpec;
use crate::Result;
use crate::RunContext;
use crate::build_result;
use crate::clamp_to_bounds;
use crate::random_point;
use crate::seeded_rng;

/// Simulated annealing with a geometric cooling schedule. Each iteration
/// performs a batch of Metropolis steps so the ≤100-iteration budget still
/// buys a useful amount of search.
pub struct SimulatedAnnealing;

const PARAM_SPECS: &[ParamSpec] = &[
    ParamSpec::new("max_iterations", 1.0, 100.0, 100.0),
    ParamSpec::new("steps_per_iteration", 1.0, 1000.0, 50.0),
    ParamSpec::new("initial_temperature", 1e-6, 1e4, 100.0),
    ParamSpec::new("cooling_rate", 0.5, 0.9999, 0.95),
    ParamSpec::new("step_scale", 1e-4, 1.0, 0.1),
];

impl Optimizer for SimulatedAnnealing {
    fn name(&self) -> &'static str {
        "simulated_annealing"
    }

    fn display_name(&self) -> &'static str {
        "Simulated Annealing"
    }

    fn param_specs(&self) -> &'static [ParamSpec] {
        PARAM_SPECS
    }

    fn optimize(
        &self,
        ctx: &RunContext<'_>,
        fitness: &mut FitnessFn<'_>,
    ) -> Result<OptimizationResult> {
        let started = Instant::now();
        let mut rng = seeded_rng(ctx);
        let objective = ctx.problem.objective;
        let bounds = &ctx.problem.bounds;
        let max_iterations = ctx.params.u32_value("max_iterations");
        let steps_per_iteration = ctx.params.usize_value("steps_per_iteration");
        let mut temperature = ctx.params.value("initial_temperature");
        let cooling_rate = ctx.params.value("cooling_rate");
        let step_scale = ctx.params.value("step_scale");

        let mut current = random_point(&mut rng, bounds);
        let mut current_fitness = fitness(&current)?;
        let mut best = current.clone();
        let mut best_fitness = current_fitness;

        let mut curve = Vec::with_capacity(max_iterations as usize);
        for _ in 0..max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(AlgorithmError::Cancelled);
            }
            for _ in 0..steps_per_iteration {
                let mut candidate = current.clone();
                for (d, value) in candidate.iter_mut().enumerate() {
                    let (lo, hi) = bounds[d];
                    *value += (rng.random::<f64>() * 2.0 - 1.0) * step_scale * (hi - lo);
                }
                clamp_to_bounds(&mut candidate, bounds);
                let candidate_fitness = fitness(&candidate)?;

                // Worsening moves are accepted with the Metropolis
                // probability; delta is oriented so it works for both
                // objectives.
                let delta = match objective {
                    opthub_protocol::Objective::Minimize => candidate_fitness - current_fitness,
                    opthub_protocol::Objective::Maximize => current_fitness - candidate_fitness,
                };
                let accept = delta <= 0.0 || rng.random::<f64>() < (-delta / temperature).exp();
                if accept {
                    current = candidate;
                    current_fitness = candidate_fitness;
                    if objective.improves(current_fitness, best_fitness) {
                        best_fitness = current_fitness;
                        best.clone_from(&current);
                    }
                }
            }
            temperature *= cooling_rate;
            curve.push(best_fitness);
        }

        Ok(build_result(
            self.display_name(),
            best,
            best_fitness,
            curve,
            started,
            ctx.params,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use opthub_protocol::Objective;
    use pretty_assertions::assert_eq;

    use super::SimulatedAnnealing;
    use crate::CancelFlag;
    use crate::Optimizer;
    use crate::ResolvedParams;
    use crate::RunContext;
    use crate::test_support::benchmark_problem;

    #[test]
    fn best_so_far_curve_never_regresses() -> crate::Result<()> {
        let algorithm = SimulatedAnnealing;
        let problem = benchmark_problem(2, Objective::Minimize);
        let params = ResolvedParams::resolve(algorithm.param_specs(), &BTreeMap::new())?;
        let cancel = CancelFlag::new();
        let ctx = RunContext {
            problem: &problem,
            params: &params,
            cancel: &cancel,
            seed: Some(23),
        };
        let result = algorithm.optimize(&ctx, &mut |x| Ok(x.iter().map(|v| v * v).sum()))?;

        assert_eq!(result.iterations_completed, 100);
        for window in result.convergence_curve.windows(2) {
            assert!(window[1] <= window[0]);
        }
        assert!(result.best_fitness < 1.0, "{}", result.best_fitness);
        Ok(())
    }
}
