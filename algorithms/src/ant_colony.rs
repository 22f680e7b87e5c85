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

/// Continuous ant colony optimization (ACO-R): a ranked solution archive
/// from which each ant samples a gaussian kernel per dimension.
pub struct AntColony;

const PARAM_SPECS: &[ParamSpec] = &[
    ParamSpec::new("archive_size", 5.0, 100.0, 30.0),
    ParamSpec::new("num_ants", 2.0, 100.0, 10.0),
    ParamSpec::new("max_iterations", 1.0, 100.0, 50.0),
    // Locality of the search: small q concentrates sampling on the best
    // archive entries.
    ParamSpec::new("q", 1e-4, 1.0, 0.1),
    // Convergence speed: the std-dev multiplier of the gaussian kernels.
    ParamSpec::new("xi", 0.01, 1.0, 0.85),
];

impl Optimizer for AntColony {
    fn name(&self) -> &'static str {
        "ant_colony"
    }

    fn display_name(&self) -> &'static str {
        "Ant Colony Optimization"
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
        let dim = ctx.problem.dim;
        let archive_size = ctx.params.usize_value("archive_size");
        let num_ants = ctx.params.usize_value("num_ants");
        let max_iterations = ctx.params.u32_value("max_iterations");
        let q = ctx.params.value("q");
        let xi = ctx.params.value("xi");

        let mut archive: Vec<(Vec<f64>, f64)> = Vec::with_capacity(archive_size);
        for _ in 0..archive_size {
            let point = random_point(&mut rng, bounds);
            let value = fitness(&point)?;
            archive.push((point, value));
        }
        sort_archive(&mut archive, objective);

        // Rank-based weights, fixed for the whole run.
        let k = archive_size as f64;
        let weights: Vec<f64> = (0..archive_size)
            .map(|rank| {
                let r = rank as f64;
                (-r * r / (2.0 * q * q * k * k)).exp() / (q * k * (2.0 * std::f64::consts::PI).sqrt())
            })
            .collect();
        let weight_sum: f64 = weights.iter().sum();

        let mut curve = Vec::with_capacity(max_iterations as usize);
        for _ in 0..max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(AlgorithmError::Cancelled);
            }
            for _ in 0..num_ants {
                // Pick a guide solution by rank weight.
                let mut pick = rng.random::<f64>() * weight_sum;
                let mut guide = 0;
                for (i, weight) in weights.iter().enumerate() {
                    pick -= weight;
                    if pick <= 0.0 {
                        guide = i;
                        break;
                    }
                }

                let mut candidate = vec![0.0; dim];
                for d in 0..dim {
                    let mean = archive[guide].0[d];
                    let spread: f64 = archive
                        .iter()
                        .map(|(point, _)| (point[d] - mean).abs())
                        .sum::<f64>()
                        / (k - 1.0).max(1.0);
                    candidate[d] = mean + xi * spread * gaussian(&mut rng);
                }
                clamp_to_bounds(&mut candidate, bounds);
                let value = fitness(&candidate)?;
                archive.push((candidate, value));
            }
            sort_archive(&mut archive, objective);
            archive.truncate(archive_size);
            curve.push(archive[0].1);
        }

        let (best_solution, best_fitness) = archive.swap_remove(0);
        Ok(build_result(
            self.display_name(),
            best_solution,
            best_fitness,
            curve,
            started,
            ctx.params,
        ))
    }
}

fn sort_archive(archive: &mut [(Vec<f64>, f64)], objective: opthub_protocol::Objective) {
    archive.sort_by(|a, b| match objective {
        opthub_protocol::Objective::Minimize => a.1.total_cmp(&b.1),
        opthub_protocol::Objective::Maximize => b.1.total_cmp(&a.1),
    });
}

/// Standard normal via Box-Muller.
fn gaussian(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use opthub_protocol::Objective;
    use pretty_assertions::assert_eq;

    use super::AntColony;
    use crate::CancelFlag;
    use crate::Optimizer;
    use crate::ResolvedParams;
    use crate::RunContext;
    use crate::test_support::benchmark_problem;

    #[test]
    fn converges_on_the_sphere() -> crate::Result<()> {
        let algorithm = AntColony;
        let problem = benchmark_problem(2, Objective::Minimize);
        let params = ResolvedParams::resolve(algorithm.param_specs(), &BTreeMap::new())?;
        let cancel = CancelFlag::new();
        let ctx = RunContext {
            problem: &problem,
            params: &params,
            cancel: &cancel,
            seed: Some(31),
        };
        let result = algorithm.optimize(&ctx, &mut |x| Ok(x.iter().map(|v| v * v).sum()))?;

        assert!(result.best_fitness < 1e-1, "{}", result.best_fitness);
        assert_eq!(result.iterations_completed, 50);
        for window in result.convergence_curve.windows(2) {
            assert!(window[1] <= window[0]);
        }
        Ok(())
    }
}
