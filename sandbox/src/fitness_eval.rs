//! Starlark evaluation of user fitness code.
//!
//! The user's module is evaluated once; every fitness call then invokes the
//! resolved `fitness` function with a fresh evaluator over that module.

use opthub_algorithms::AlgorithmError;
use opthub_algorithms::CancelFlag;
use opthub_algorithms::ResolvedParams;
use opthub_algorithms::RunContext;
use opthub_algorithms::find_algorithm;
use opthub_protocol::JobError;
use opthub_protocol::OptimizationResult;
use opthub_protocol::SandboxJobSpec;
use starlark::environment::Globals;
use starlark::environment::GlobalsBuilder;
use starlark::environment::Module;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::syntax::AstModule;
use starlark::syntax::Dialect;
use starlark::values::Value;
use starlark::values::ValueLike;
use starlark::values::float::StarlarkFloat;
use starlark::values::float::UnpackFloat;
use starlark::values::list::UnpackList;

const SOURCE_NAME: &str = "fitness.py";

/// `math` namespace offered to user code in place of the Python module of
/// the same name. Constant names match their Python spellings.
#[allow(non_upper_case_globals)]
#[starlark_module]
fn math_namespace(builder: &mut GlobalsBuilder) {
    const pi: f64 = std::f64::consts::PI;
    const e: f64 = std::f64::consts::E;

    fn sqrt(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.sqrt())
    }

    fn sin(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.sin())
    }

    fn cos(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.cos())
    }

    fn tan(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.tan())
    }

    fn exp(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.exp())
    }

    fn log(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.ln())
    }

    fn floor(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.floor())
    }

    fn ceil(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.ceil())
    }

    fn fabs(x: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.abs())
    }

    fn pow(x: UnpackFloat, y: UnpackFloat) -> anyhow::Result<f64> {
        Ok(x.0.powf(y.0))
    }
}

/// Builtins Python fitness code expects that the Starlark standard library
/// does not define.
#[starlark_module]
fn fitness_builtins(builder: &mut GlobalsBuilder) {
    fn sum(xs: UnpackList<UnpackFloat>) -> anyhow::Result<f64> {
        Ok(xs.items.iter().map(|x| x.0).sum())
    }
}

fn fitness_globals() -> Globals {
    GlobalsBuilder::standard()
        .with(fitness_builtins)
        .with_namespace("math", math_namespace)
        .build()
}

fn unpack_numeric(value: Value<'_>) -> Option<f64> {
    if let Some(i) = value.unpack_i32() {
        return Some(f64::from(i));
    }
    value.downcast_ref::<StarlarkFloat>().map(|float| float.0)
}

/// Run the named algorithm against the user fitness function. Called inside
/// the already-hardened child process.
pub(crate) fn run_user_optimization(
    source: &str,
    spec: &SandboxJobSpec,
) -> Result<OptimizationResult, JobError> {
    // Re-check the source even though the boundary already did; the sandbox
    // must not trust its caller.
    opthub_fitness_policy::validate(source)
        .map_err(|rejection| JobError::validation(rejection.to_string()))?;

    let algorithm = find_algorithm(&spec.algorithm)
        .ok_or_else(|| JobError::validation(format!("unknown algorithm: {}", spec.algorithm)))?;
    let params = ResolvedParams::resolve(algorithm.param_specs(), &spec.params)
        .map_err(|err| JobError::validation(err.to_string()))?;
    let problem = spec.problem.clone();
    problem
        .validate()
        .map_err(|err| JobError::validation(err.message))?;

    let executable = opthub_fitness_policy::executable_source(source);
    let ast = AstModule::parse(SOURCE_NAME, executable, &Dialect::Standard)
        .map_err(|err| JobError::validation(format!("fitness source failed to parse: {err}")))?;

    let globals = fitness_globals();
    let module = Module::new();
    {
        let mut eval = Evaluator::new(&module);
        eval.eval_module(ast, &globals)
            .map_err(|err| JobError::runtime(format!("fitness module failed to load: {err}")))?;
    }
    let fitness = module
        .get("fitness")
        .ok_or_else(|| JobError::validation("no fitness function defined"))?;

    let cancel = CancelFlag::new();
    let ctx = RunContext {
        problem: &problem,
        params: &params,
        cancel: &cancel,
        seed: None,
    };
    let mut fitness_fn = |x: &[f64]| -> opthub_algorithms::Result<f64> {
        let mut eval = Evaluator::new(&module);
        let arg = module.heap().alloc(x.to_vec());
        let ret = eval
            .eval_function(fitness, &[arg], &[])
            .map_err(|err| AlgorithmError::Fitness(err.kind().to_string()))?;
        unpack_numeric(ret).ok_or_else(|| {
            AlgorithmError::Fitness(format!(
                "fitness returned a non-numeric value of type {}",
                ret.get_type()
            ))
        })
    };

    algorithm
        .optimize(&ctx, &mut fitness_fn)
        .map_err(|err| match err {
            AlgorithmError::Cancelled => JobError::timeout("run cancelled before completion"),
            other => JobError::runtime(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use opthub_protocol::ErrorKind;
    use opthub_protocol::SandboxJobSpec;
    use pretty_assertions::assert_eq;

    use super::run_user_optimization;

    fn spec(dim: usize) -> Result<SandboxJobSpec, serde_json::Error> {
        let problem = serde_json::from_value(serde_json::json!({
            "dim": dim,
            "bounds": vec![[-5.0, 5.0]; dim],
            "objective": "minimize",
            "fitness_source": "placeholder",
        }))?;
        Ok(SandboxJobSpec {
            algorithm: "particle_swarm".to_string(),
            params: BTreeMap::from([
                ("swarm_size".to_string(), 10.0),
                ("max_iterations".to_string(), 20.0),
            ]),
            problem,
        })
    }

    #[test]
    fn evaluates_a_quadratic_fitness() -> Result<(), serde_json::Error> {
        let source = "def fitness(x):\n    return sum([xi * xi for xi in x])\n";
        let result = run_user_optimization(source, &spec(2)?);
        let result = match result {
            Ok(result) => result,
            Err(err) => panic!("expected success, got {err:?}"),
        };
        assert!(result.best_fitness < 1.0, "{}", result.best_fitness);
        assert_eq!(result.iterations_completed, 20);
        Ok(())
    }

    #[test]
    fn math_namespace_is_available() -> Result<(), serde_json::Error> {
        let source = "import math\n\ndef fitness(x):\n    return math.sqrt(x[0] * x[0] + 1.0)\n";
        let result = run_user_optimization(source, &spec(1)?);
        assert!(result.is_ok(), "{result:?}");
        Ok(())
    }

    #[test]
    fn raising_fitness_maps_to_runtime() -> Result<(), serde_json::Error> {
        let source = "def fitness(x):\n    fail(\"boom\")\n";
        let err = match run_user_optimization(source, &spec(1)?) {
            Err(err) => err,
            Ok(result) => panic!("expected failure, got {result:?}"),
        };
        assert_eq!(err.kind, ErrorKind::Runtime);
        Ok(())
    }

    #[test]
    fn non_numeric_fitness_maps_to_runtime() -> Result<(), serde_json::Error> {
        let source = "def fitness(x):\n    return \"not a number\"\n";
        let err = match run_user_optimization(source, &spec(1)?) {
            Err(err) => err,
            Ok(result) => panic!("expected failure, got {result:?}"),
        };
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert!(err.message.contains("non-numeric"), "{}", err.message);
        Ok(())
    }

    #[test]
    fn rejected_source_maps_to_validation() -> Result<(), serde_json::Error> {
        let source = "import os\n\ndef fitness(x):\n    return 0\n";
        let err = match run_user_optimization(source, &spec(1)?) {
            Err(err) => err,
            Ok(result) => panic!("expected failure, got {result:?}"),
        };
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("os"), "{}", err.message);
        Ok(())
    }
}
