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

/// Canonical global-best particle swarm with inertia weight.
pub struct ParticleSwarm;

const PARAM_SPECS: &[ParamSpec] = &[
    ParamSpec::new("swarm_size", 5.0, 200.0, 30.0),
    ParamSpec::new("max_iterations", 1.0, 100.0, 50.0),
    ParamSpec::new("w", 0.0, 1.2, 0.7),
    ParamSpec::new("c1", 0.0, 4.0, 1.5),
    ParamSpec::new("c2", 0.0, 4.0, 1.5),
];

struct Particle {
    position: Vec<f64>,
    velocity: Vec<f64>,
    best_position: Vec<f64>,
    best_fitness: f64,
}

impl Optimizer for ParticleSwarm {
    fn name(&self) -> &'static str {
        "particle_swarm"
    }

    fn display_name(&self) -> &'static str {
        "Particle Swarm Optimization"
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
        let swarm_size = ctx.params.usize_value("swarm_size");
        let max_iterations = ctx.params.u32_value("max_iterations");
        let w = ctx.params.value("w");
        let c1 = ctx.params.value("c1");
        let c2 = ctx.params.value("c2");

        let mut swarm = Vec::with_capacity(swarm_size);
        let mut global_best_position = Vec::new();
        let mut global_best_fitness = objective.worst();
        for _ in 0..swarm_size {
            let position = random_point(&mut rng, bounds);
            let value = fitness(&position)?;
            if objective.improves(value, global_best_fitness) {
                global_best_fitness = value;
                global_best_position = position.clone();
            }
            swarm.push(Particle {
                velocity: vec![0.0; position.len()],
                best_position: position.clone(),
                best_fitness: value,
                position,
            });
        }
        if global_best_position.is_empty() {
            // Every initial fitness was NaN; fall back to an arbitrary
            // particle so the velocity update has a target.
            global_best_position = swarm[0].position.clone();
            global_best_fitness = swarm[0].best_fitness;
        }

        let mut curve = Vec::with_capacity(max_iterations as usize);
        for _ in 0..max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(AlgorithmError::Cancelled);
            }
            for particle in &mut swarm {
                for d in 0..particle.position.len() {
                    let r1: f64 = rng.random();
                    let r2: f64 = rng.random();
                    particle.velocity[d] = w * particle.velocity[d]
                        + c1 * r1 * (particle.best_position[d] - particle.position[d])
                        + c2 * r2 * (global_best_position[d] - particle.position[d]);
                    particle.position[d] += particle.velocity[d];
                }
                clamp_to_bounds(&mut particle.position, bounds);
                let value = fitness(&particle.position)?;
                if objective.improves(value, particle.best_fitness) {
                    particle.best_fitness = value;
                    particle.best_position.clone_from(&particle.position);
                }
                if objective.improves(value, global_best_fitness) {
                    global_best_fitness = value;
                    global_best_position.clone_from(&particle.position);
                }
            }
            curve.push(global_best_fitness);
        }

        Ok(build_result(
            self.display_name(),
            global_best_position,
            global_best_fitness,
            curve,
            started,
            ctx.params,
        ))
    }
}
