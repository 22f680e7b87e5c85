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

/// DE/rand/1/bin.
pub struct DifferentialEvolution;

const PARAM_SPECS: &[ParamSpec] = &[
    ParamSpec::new("population_size", 5.0, 200.0, 40.0),
    ParamSpec::new("max_iterations", 1.0, 100.0, 50.0),
    ParamSpec::new("differential_weight", 0.0, 2.0, 0.8),
    ParamSpec::new("crossover_rate", 0.0, 1.0, 0.9),
];

impl Optimizer for DifferentialEvolution {
    fn name(&self) -> &'static str {
        "differential_evolution"
    }

    fn display_name(&self) -> &'static str {
        "Differential Evolution"
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
        let population_size = ctx.params.usize_value("population_size");
        let max_iterations = ctx.params.u32_value("max_iterations");
        let f = ctx.params.value("differential_weight");
        let cr = ctx.params.value("crossover_rate");

        let mut population: Vec<Vec<f64>> = (0..population_size)
            .map(|_| random_point(&mut rng, bounds))
            .collect();
        let mut scores = Vec::with_capacity(population_size);
        for individual in &population {
            scores.push(fitness(individual)?);
        }

        let mut curve = Vec::with_capacity(max_iterations as usize);
        for _ in 0..max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(AlgorithmError::Cancelled);
            }
            for i in 0..population_size {
                let (a, b, c) = distinct_indices(i, population_size, &mut rng);
                let forced = rng.random_range(0..dim);
                let mut trial = population[i].clone();
                for d in 0..dim {
                    if d == forced || rng.random::<f64>() < cr {
                        trial[d] = population[a][d] + f * (population[b][d] - population[c][d]);
                    }
                }
                clamp_to_bounds(&mut trial, bounds);
                let trial_score = fitness(&trial)?;
                if objective.improves(trial_score, scores[i]) || trial_score == scores[i] {
                    population[i] = trial;
                    scores[i] = trial_score;
                }
            }
            let best = best_score(&scores, objective);
            curve.push(best);
        }

        let best_index = (0..population_size)
            .reduce(|best, i| {
                if objective.improves(scores[i], scores[best]) {
                    i
                } else {
                    best
                }
            })
            .unwrap_or_default();
        Ok(build_result(
            self.display_name(),
            population[best_index].clone(),
            scores[best_index],
            curve,
            started,
            ctx.params,
        ))
    }
}

/// Three distinct indices, all different from `exclude`. Requires a
/// population of at least four, which the parameter floor guarantees.
fn distinct_indices(exclude: usize, len: usize, rng: &mut impl Rng) -> (usize, usize, usize) {
    let mut pick = |taken: &[usize]| loop {
        let candidate = rng.random_range(0..len);
        if candidate != exclude && !taken.contains(&candidate) {
            return candidate;
        }
    };
    let a = pick(&[]);
    let b = pick(&[a]);
    let c = pick(&[a, b]);
    (a, b, c)
}

fn best_score(scores: &[f64], objective: opthub_protocol::Objective) -> f64 {
    scores
        .iter()
        .copied()
        .fold(objective.worst(), |best, score| objective.better(score, best))
}
