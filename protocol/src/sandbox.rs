use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::JobError;
use crate::problem::ProblemDescriptor;
use crate::result::OptimizationResult;

/// Everything the sandboxed child needs to run one user-fitness
/// optimization. Carried inside [`ChildRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxJobSpec {
    pub algorithm: String,
    pub params: BTreeMap<String, f64>,
    pub problem: ProblemDescriptor,
}

/// Resource caps the child applies to itself before touching user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Address-space ceiling in bytes.
    pub memory_bytes: u64,
    /// CPU-seconds budget; exceeding it kills the child.
    pub cpu_secs: u64,
    /// Per-file write ceiling, which bounds the scratch directory.
    pub scratch_bytes: u64,
    /// Unprivileged identity to drop to when the child starts as root.
    pub uid: Option<u32>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_secs: 600,
            scratch_bytes: 16 * 1024 * 1024,
            uid: None,
        }
    }
}

/// The single JSON document the parent writes to the child's stdin. The
/// fitness source itself lives in the scratch directory; only its path
/// crosses the pipe. No file descriptors are shared beyond the three
/// standard streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRequest {
    pub source_path: PathBuf,
    pub spec: SandboxJobSpec,
    #[serde(default)]
    pub limits: SandboxLimits,
}

/// The single JSON document the child writes to stdout before exiting.
///
/// Structured user-level failures (validation, runtime) travel through this
/// envelope with exit code 0; anything that prevents the envelope from being
/// produced at all is diagnosed by the parent from the exit status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChildOutcome {
    Result { result: OptimizationResult },
    Error { error: JobError },
}
