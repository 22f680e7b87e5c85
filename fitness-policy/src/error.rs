use starlark::Error as StarlarkError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextPosition {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRange {
    pub start: TextPosition,
    pub end: TextPosition,
}

/// Why a fitness submission was refused. Every variant renders to a short,
/// actionable reason naming the offending construct and where it is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("import of `{module}` is not allowed (line {line}); only math and numpy may be imported")]
    ForbiddenImport { module: String, line: usize },
    #[error("reference to `{name}` is not allowed (line {line}, column {column})")]
    ForbiddenIdentifier {
        name: String,
        line: usize,
        column: usize,
    },
    #[error("access to dunder attribute `{name}` is not allowed (line {line}, column {column})")]
    DunderAttribute {
        name: String,
        line: usize,
        column: usize,
    },
    #[error("`with` statements are not allowed (line {line})")]
    WithStatement { line: usize },
    #[error("syntax error: {message}")]
    Syntax {
        message: String,
        range: Option<TextRange>,
    },
    #[error("no top-level `fitness` function found")]
    MissingFitness,
    #[error("`fitness` must take exactly one parameter, found {found}")]
    FitnessArity { found: usize },
}

impl Rejection {
    pub(crate) fn from_parse_error(err: &StarlarkError) -> Self {
        let range = err.span().map(|span| {
            let resolved = span.resolve_span();
            TextRange {
                start: TextPosition {
                    line: resolved.begin.line + 1,
                    column: resolved.begin.column + 1,
                },
                end: TextPosition {
                    line: resolved.end.line + 1,
                    column: resolved.end.column + 1,
                },
            }
        });
        Self::Syntax {
            message: err.kind().to_string(),
            range,
        }
    }
}
