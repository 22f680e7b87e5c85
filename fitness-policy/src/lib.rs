//! Static validation of user-supplied fitness source.
//!
//! The validator is a pure function and a defense-in-depth layer: the
//! sandbox provides the actual containment, this crate exists to give fast,
//! actionable feedback and to close the easy classes of abuse before any
//! sandbox resources are spent. It is deliberately conservative; a static
//! rejection is preferred to dynamic containment alone.
//!
//! Checks run in three stages:
//! 1. a token scan that names forbidden imports, denied builtins, dunder
//!    attribute access, and `with` statements (see `scan`),
//! 2. a Starlark parse, which is the executable dialect of the sandbox, so
//!    anything it refuses here would also refuse to load there,
//! 3. an arity check for the required top-level `fitness` function.

mod error;
mod scan;

pub use error::Rejection;
pub use error::TextPosition;
pub use error::TextRange;

use starlark::syntax::AstModule;
use starlark::syntax::Dialect;

/// File name used for parse diagnostics.
const SOURCE_NAME: &str = "fitness.py";

/// Decide whether `source` is safe to hand to the sandbox executor.
///
/// Never panics on arbitrary input; malformed source yields
/// [`Rejection::Syntax`] with the parser's location.
pub fn validate(source: &str) -> Result<(), Rejection> {
    scan::scan(source)?;

    AstModule::parse(SOURCE_NAME, executable_source(source), &Dialect::Standard)
        .map_err(|err| Rejection::from_parse_error(&err))?;

    scan::fitness_arity(source)
}

/// The source as the execution dialect runs it: allowed `import` statements
/// rewritten into namespace bindings, line numbering preserved. The sandbox
/// evaluates exactly this text, so the parse in [`validate`] vouches for
/// what will actually load.
pub fn executable_source(source: &str) -> String {
    scan::rewrite_import_lines(source)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Rejection;
    use super::validate;

    #[test]
    fn accepts_a_plain_quadratic() {
        let source = "def fitness(x):\n    return sum([xi * xi for xi in x])\n";
        assert_eq!(validate(source), Ok(()));
    }

    #[test]
    fn accepts_math_imports() {
        let source = "import math\n\ndef fitness(x):\n    return math.sqrt(x[0] * x[0])\n";
        assert_eq!(validate(source), Ok(()));
    }

    #[test]
    fn import_rewrite_preserves_line_count() {
        let source = "from math import sqrt, cos\nimport math as m\n\ndef fitness(x):\n    return sqrt(x[0])\n";
        let rewritten = super::executable_source(source);
        assert_eq!(rewritten.lines().count(), source.lines().count());
        assert_eq!(
            rewritten.lines().next(),
            Some("sqrt = math.sqrt; cos = math.cos")
        );
        assert_eq!(rewritten.lines().nth(1), Some("m = math"));
    }

    #[test]
    fn rejects_os_import_before_parsing() {
        let err = validate("import os\ndef fitness(x):\n    return 0\n");
        assert_eq!(
            err,
            Err(Rejection::ForbiddenImport {
                module: "os".to_string(),
                line: 1,
            })
        );
    }

    #[test]
    fn rejects_malformed_source_with_a_location() {
        let err = validate("def fitness(x:\n    return 0\n");
        assert!(matches!(err, Err(Rejection::Syntax { .. })), "{err:?}");
    }

    #[test]
    fn rejects_missing_fitness_definition() {
        let err = validate("def objective(x):\n    return 0\n");
        assert_eq!(err, Err(Rejection::MissingFitness));
    }
}
