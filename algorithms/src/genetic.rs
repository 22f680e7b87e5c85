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

/// Real-coded genetic algorithm: tournament selection, blend crossover,
/// gaussian mutation, one elite carried over per generation.
pub struct GeneticAlgorithm;

const PARAM_SPECS: &[ParamSpec] = &[
    ParamSpec::new("population_size", 5.0, 200.0, 50.0),
    ParamSpec::new("max_iterations", 1.0, 100.0, 50.0),
    ParamSpec::new("crossover_rate", 0.0, 1.0, 0.8),
    ParamSpec::new("mutation_rate", 0.0, 1.0, 0.1),
    ParamSpec::new("tournament_size", 2.0, 10.0, 3.0),
];

impl Optimizer for GeneticAlgorithm {
    fn name(&self) -> &'static str {
        "genetic_algorithm"
    }

    fn display_name(&self) -> &'static str {
        "Genetic Algorithm"
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
        let population_size = ctx.params.usize_value("population_size");
        let max_iterations = ctx.params.u32_value("max_iterations");
        let crossover_rate = ctx.params.value("crossover_rate");
        let mutation_rate = ctx.params.value("mutation_rate");
        let tournament_size = ctx.params.usize_value("tournament_size");

        let mut population: Vec<Vec<f64>> = (0..population_size)
            .map(|_| random_point(&mut rng, bounds))
            .collect();
        let mut scores = Vec::with_capacity(population_size);
        for individual in &population {
            scores.push(fitness(individual)?);
        }

        let mut best_index = best_of(&scores, objective);
        let mut best_solution = population[best_index].clone();
        let mut best_fitness = scores[best_index];

        let mut curve = Vec::with_capacity(max_iterations as usize);
        for _ in 0..max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(AlgorithmError::Cancelled);
            }

            let mut next_population = Vec::with_capacity(population_size);
            next_population.push(best_solution.clone());
            while next_population.len() < population_size {
                let parent_a = tournament(&population, &scores, tournament_size, objective, &mut rng);
                let parent_b = tournament(&population, &scores, tournament_size, objective, &mut rng);
                let mut child = if rng.random::<f64>() < crossover_rate {
                    blend(parent_a, parent_b, &mut rng)
                } else {
                    parent_a.to_vec()
                };
                for (d, gene) in child.iter_mut().enumerate() {
                    if rng.random::<f64>() < mutation_rate {
                        let (lo, hi) = bounds[d];
                        *gene += (rng.random::<f64>() - 0.5) * 0.2 * (hi - lo);
                    }
                }
                clamp_to_bounds(&mut child, bounds);
                next_population.push(child);
            }

            population = next_population;
            scores.clear();
            for individual in &population {
                scores.push(fitness(individual)?);
            }
            best_index = best_of(&scores, objective);
            if objective.improves(scores[best_index], best_fitness) {
                best_fitness = scores[best_index];
                best_solution.clone_from(&population[best_index]);
            }
            curve.push(best_fitness);
        }

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

fn best_of(scores: &[f64], objective: opthub_protocol::Objective) -> usize {
    let mut best = 0;
    for (i, score) in scores.iter().enumerate() {
        if objective.improves(*score, scores[best]) {
            best = i;
        }
    }
    best
}

fn tournament<'a>(
    population: &'a [Vec<f64>],
    scores: &[f64],
    size: usize,
    objective: opthub_protocol::Objective,
    rng: &mut impl Rng,
) -> &'a [f64] {
    let mut winner = rng.random_range(0..population.len());
    for _ in 1..size {
        let challenger = rng.random_range(0..population.len());
        if objective.improves(scores[challenger], scores[winner]) {
            winner = challenger;
        }
    }
    &population[winner]
}

fn blend(a: &[f64], b: &[f64], rng: &mut impl Rng) -> Vec<f64> {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let t: f64 = rng.random();
            x + t * (y - x)
        })
        .collect()
}
