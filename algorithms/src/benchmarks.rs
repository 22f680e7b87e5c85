use std::f64::consts::E;
use std::f64::consts::PI;

/// One entry of the built-in fitness catalog. All benchmarks are
/// minimization problems with their optimum at the listed point.
#[derive(Debug, Clone, Copy)]
pub struct Benchmark {
    pub name: &'static str,
    pub eval: fn(&[f64]) -> f64,
}

const CATALOG: &[Benchmark] = &[
    Benchmark {
        name: "sphere",
        eval: sphere,
    },
    Benchmark {
        name: "rastrigin",
        eval: rastrigin,
    },
    Benchmark {
        name: "rosenbrock",
        eval: rosenbrock,
    },
    Benchmark {
        name: "ackley",
        eval: ackley,
    },
    Benchmark {
        name: "griewank",
        eval: griewank,
    },
];

pub fn find_benchmark(name: &str) -> Option<&'static Benchmark> {
    CATALOG.iter().find(|benchmark| benchmark.name == name)
}

fn sphere(x: &[f64]) -> f64 {
    x.iter().map(|xi| xi * xi).sum()
}

fn rastrigin(x: &[f64]) -> f64 {
    10.0 * x.len() as f64
        + x.iter()
            .map(|xi| xi * xi - 10.0 * (2.0 * PI * xi).cos())
            .sum::<f64>()
}

fn rosenbrock(x: &[f64]) -> f64 {
    x.windows(2)
        .map(|pair| {
            let (a, b) = (pair[0], pair[1]);
            100.0 * (b - a * a).powi(2) + (1.0 - a).powi(2)
        })
        .sum()
}

fn ackley(x: &[f64]) -> f64 {
    let n = x.len() as f64;
    let sum_sq: f64 = x.iter().map(|xi| xi * xi).sum();
    let sum_cos: f64 = x.iter().map(|xi| (2.0 * PI * xi).cos()).sum();
    -20.0 * (-0.2 * (sum_sq / n).sqrt()).exp() - (sum_cos / n).exp() + 20.0 + E
}

fn griewank(x: &[f64]) -> f64 {
    let sum: f64 = x.iter().map(|xi| xi * xi / 4000.0).sum();
    let product: f64 = x
        .iter()
        .enumerate()
        .map(|(i, xi)| (xi / ((i + 1) as f64).sqrt()).cos())
        .product();
    sum - product + 1.0
}
