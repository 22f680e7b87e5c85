use serde::Deserialize;
use serde::Serialize;

use crate::error::JobError;

/// Optimization direction for a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    Minimize,
    Maximize,
}

impl Objective {
    /// Whether `candidate` is strictly better than `incumbent` under this
    /// objective.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Objective::Minimize => candidate < incumbent,
            Objective::Maximize => candidate > incumbent,
        }
    }

    /// The fitness value every candidate improves on.
    pub fn worst(self) -> f64 {
        match self {
            Objective::Minimize => f64::INFINITY,
            Objective::Maximize => f64::NEG_INFINITY,
        }
    }

    pub fn better(self, a: f64, b: f64) -> f64 {
        if self.improves(a, b) { a } else { b }
    }
}

/// City coordinates for a travelling-salesman problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TspData {
    pub cities: Vec<[f64; 2]>,
}

/// Item weights/values and a capacity for a 0/1 knapsack problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnapsackData {
    pub weights: Vec<f64>,
    pub values: Vec<f64>,
    pub capacity: f64,
}

/// How the fitness of a candidate solution is computed.
///
/// The variants are distinguished by their required keys, so the submission
/// boundary can stay untagged. Historical field-name drift
/// (`fitness_function_name`, `fitness_function`) is absorbed here with serde
/// aliases; everything past this type uses the canonical selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FitnessSelector {
    Benchmark {
        #[serde(
            rename = "fitness",
            alias = "fitness_function",
            alias = "fitness_function_name"
        )]
        name: String,
    },
    UserSupplied {
        #[serde(rename = "fitness_source")]
        source: String,
    },
    Tsp {
        #[serde(flatten)]
        tsp: TspData,
    },
    Knapsack {
        #[serde(flatten)]
        knapsack: KnapsackData,
    },
}

/// Finite, immutable description of one optimization problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDescriptor {
    #[serde(alias = "n", alias = "dimensions")]
    pub dim: usize,
    pub bounds: Vec<(f64, f64)>,
    pub objective: Objective,
    #[serde(flatten)]
    pub fitness: FitnessSelector,
}

impl ProblemDescriptor {
    /// Structural validation applied at the submission boundary.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.dim == 0 {
            return Err(JobError::validation("problem dimensionality must be >= 1"));
        }
        if self.bounds.len() != self.dim {
            return Err(JobError::validation(format!(
                "expected {} bounds pairs, got {}",
                self.dim,
                self.bounds.len()
            )));
        }
        for (i, (lo, hi)) in self.bounds.iter().enumerate() {
            if !lo.is_finite() || !hi.is_finite() || lo > hi {
                return Err(JobError::validation(format!(
                    "bounds[{i}] must satisfy lo <= hi with finite values, got ({lo}, {hi})"
                )));
            }
        }
        match &self.fitness {
            FitnessSelector::Benchmark { name } => {
                if name.is_empty() {
                    return Err(JobError::validation("fitness function name is empty"));
                }
            }
            FitnessSelector::UserSupplied { source } => {
                if source.trim().is_empty() {
                    return Err(JobError::validation("user fitness source is empty"));
                }
            }
            FitnessSelector::Tsp { tsp } => {
                if tsp.cities.len() < 2 {
                    return Err(JobError::validation("tsp problems need at least two cities"));
                }
            }
            FitnessSelector::Knapsack { knapsack } => {
                if knapsack.weights.is_empty() || knapsack.weights.len() != knapsack.values.len() {
                    return Err(JobError::validation(
                        "knapsack weights and values must be non-empty and equal length",
                    ));
                }
                if !(knapsack.capacity > 0.0) {
                    return Err(JobError::validation("knapsack capacity must be positive"));
                }
            }
        }
        Ok(())
    }

    /// For `tsp` and `knapsack` problems the search space is implied by the
    /// auxiliary data: dimensionality, bounds, and objective are forced to
    /// the canonical values for the problem type, whatever the submission
    /// said. Benchmark and user-supplied problems pass through unchanged.
    pub fn canonicalized(mut self) -> Self {
        match &self.fitness {
            FitnessSelector::Tsp { tsp } => {
                let n = tsp.cities.len();
                self.dim = n;
                self.bounds = vec![(0.0, n as f64); n];
                self.objective = Objective::Minimize;
            }
            FitnessSelector::Knapsack { knapsack } => {
                let n = knapsack.weights.len();
                self.dim = n;
                self.bounds = vec![(0.0, 1.0); n];
                self.objective = Objective::Maximize;
            }
            FitnessSelector::Benchmark { .. } | FitnessSelector::UserSupplied { .. } => {}
        }
        self
    }
}
