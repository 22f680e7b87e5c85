//! Token-level scan of fitness source.
//!
//! The scan runs before the Starlark parse so that denied constructs are
//! reported with a reason naming the offending token, not as a generic
//! syntax error. It understands comments and string literals (including
//! triple-quoted ones) well enough never to flag their contents.

use crate::error::Rejection;

/// Module roots user code may import. Submodules of these pass as well.
const ALLOWED_IMPORT_ROOTS: &[&str] = &["math", "numpy"];

/// Builtins and module names whose mere mention is refused: dynamic code
/// execution, file and console IO, introspection, OS/process bridges, and
/// deserialization primitives.
const DENIED_IDENTIFIERS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "__import__",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "dir",
    "breakpoint",
    "exit",
    "quit",
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "pathlib",
    "importlib",
    "builtins",
    "ctypes",
    "pickle",
    "marshal",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
    column: usize,
    /// The token is the right-hand side of a `.` attribute access.
    is_attribute: bool,
    /// The token is the first word of its logical line.
    starts_line: bool,
}

pub(crate) fn scan(source: &str) -> Result<(), Rejection> {
    let tokens = tokenize(source);

    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];

        if token.starts_line {
            match token.text.as_str() {
                "import" | "from" => {
                    let module = tokens
                        .get(i + 1)
                        .map(|t| t.text.clone())
                        .unwrap_or_default();
                    let root = module.split('.').next().unwrap_or_default();
                    if !ALLOWED_IMPORT_ROOTS.contains(&root) {
                        return Err(Rejection::ForbiddenImport {
                            module: if module.is_empty() {
                                "<missing>".to_string()
                            } else {
                                module
                            },
                            line: token.line,
                        });
                    }
                    // Skip the dotted module path we just vetted so its
                    // segments are not re-checked as bare identifiers.
                    // Dunder segments stay forbidden even under an allowed
                    // root.
                    i += 2;
                    while i < tokens.len() && tokens[i].is_attribute {
                        if is_dunder(&tokens[i].text) {
                            return Err(Rejection::DunderAttribute {
                                name: tokens[i].text.clone(),
                                line: tokens[i].line,
                                column: tokens[i].column,
                            });
                        }
                        i += 1;
                    }
                    continue;
                }
                "with" => {
                    return Err(Rejection::WithStatement { line: token.line });
                }
                _ => {}
            }
        }

        if token.is_attribute && is_dunder(&token.text) {
            return Err(Rejection::DunderAttribute {
                name: token.text.clone(),
                line: token.line,
                column: token.column,
            });
        }

        if DENIED_IDENTIFIERS.contains(&token.text.as_str()) {
            return Err(Rejection::ForbiddenIdentifier {
                name: token.text.clone(),
                line: token.line,
                column: token.column,
            });
        }

        i += 1;
    }
    Ok(())
}

/// Locate a top-level `def fitness(...)` and count its parameters.
pub(crate) fn fitness_arity(source: &str) -> Result<(), Rejection> {
    let mut chars: Vec<char> = Vec::new();
    for line in logical_source_lines(source) {
        chars.extend(line.chars());
        chars.push('\n');
    }
    let text: String = chars.into_iter().collect();

    for (offset, _) in text.match_indices("def ") {
        let at_top_level = offset == 0 || text.as_bytes()[offset - 1] == b'\n';
        if !at_top_level {
            continue;
        }
        let rest = &text[offset + 4..];
        let Some(rest) = rest.trim_start().strip_prefix("fitness") else {
            continue;
        };
        let Some(args) = rest.trim_start().strip_prefix('(') else {
            continue;
        };
        let Some(close) = args.find(')') else {
            continue;
        };
        let arg_list = &args[..close];
        let found = arg_list
            .split(',')
            .filter(|piece| !piece.trim().is_empty())
            .count();
        if found == 1 {
            return Ok(());
        }
        return Err(Rejection::FitnessArity { found });
    }
    Err(Rejection::MissingFitness)
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Rewrite vetted Python import statements into the bindings the execution
/// dialect understands, keeping the line count identical so diagnostics
/// still point at the user's source.
///
/// - `import math`            -> (blank; `math` is a provided namespace)
/// - `import math as m`       -> `m = math`
/// - `from math import a, b`  -> `a = math.a; b = math.b`
/// - `from m import a as b`   -> `b = m.a`
pub(crate) fn rewrite_import_lines(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        if let Some(rest) = trimmed.strip_prefix("import ") {
            let mut bindings = Vec::new();
            for piece in rest.split(',') {
                let mut parts = piece.split_whitespace();
                let module = parts.next().unwrap_or_default();
                if parts.next() == Some("as") {
                    let alias = parts.next().unwrap_or_default();
                    bindings.push(format!("{alias} = {module}"));
                }
            }
            out.push_str(indent);
            out.push_str(&bindings.join("; "));
        } else if let Some(rest) = trimmed.strip_prefix("from ") {
            if let Some((module, names)) = rest.split_once(" import ") {
                let module = module.trim();
                let mut bindings = Vec::new();
                for piece in names.split(',') {
                    let mut parts = piece.split_whitespace();
                    let name = parts.next().unwrap_or_default();
                    let alias = if parts.next() == Some("as") {
                        parts.next().unwrap_or(name)
                    } else {
                        name
                    };
                    if !name.is_empty() {
                        bindings.push(format!("{alias} = {module}.{name}"));
                    }
                }
                out.push_str(indent);
                out.push_str(&bindings.join("; "));
            } else {
                out.push_str(line);
            }
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Source lines with comments and string-literal contents blanked out.
fn logical_source_lines(source: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut in_triple: Option<char> = None;
    for raw_line in source.lines() {
        let mut out = String::with_capacity(raw_line.len());
        let bytes: Vec<char> = raw_line.chars().collect();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if let Some(quote) = in_triple {
                if c == quote && bytes.get(i + 1) == Some(&quote) && bytes.get(i + 2) == Some(&quote)
                {
                    in_triple = None;
                    i += 3;
                } else {
                    i += 1;
                }
                out.push(' ');
                continue;
            }
            match c {
                '#' => break,
                '\'' | '"' => {
                    if bytes.get(i + 1) == Some(&c) && bytes.get(i + 2) == Some(&c) {
                        in_triple = Some(c);
                        i += 3;
                        out.push_str("   ");
                        continue;
                    }
                    // Single-quoted literal: skip to the closing quote,
                    // honoring backslash escapes.
                    out.push(' ');
                    i += 1;
                    while i < bytes.len() {
                        if bytes[i] == '\\' {
                            i += 2;
                            out.push_str("  ");
                            continue;
                        }
                        let closed = bytes[i] == c;
                        out.push(' ');
                        i += 1;
                        if closed {
                            break;
                        }
                    }
                    continue;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        lines.push(out);
    }
    lines
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (line_index, line) in logical_source_lines(source).iter().enumerate() {
        let mut first_on_line = true;
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_alphabetic() || c == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let is_attribute = chars[..start]
                    .iter()
                    .rev()
                    .find(|ch| !ch.is_whitespace())
                    .is_some_and(|ch| *ch == '.');
                tokens.push(Token {
                    text,
                    line: line_index + 1,
                    column: start + 1,
                    is_attribute,
                    starts_line: first_on_line,
                });
                first_on_line = false;
            } else {
                if !c.is_whitespace() {
                    first_on_line = false;
                }
                i += 1;
            }
        }
    }
    tokens
}
