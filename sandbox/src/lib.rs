//! Sandboxed execution of user-supplied fitness code.
//!
//! The parent side ([`SandboxExecutor`]) launches the `opthub-sandbox`
//! child binary with a JSON request on stdin and reads a single JSON
//! outcome from its stdout. The child applies its own restrictions before
//! loading user code:
//! - rlimits (address space, CPU seconds, file size) and a uid drop,
//! - `no_new_privs` + a seccomp filter denying network syscalls,
//! - Landlock rules granting read-only access to the filesystem and write
//!   access only to the scratch directory.
//!
//! User code itself runs as Starlark, which cannot import modules, open
//! files, or reach process state; the process-level restrictions exist so
//! that even an interpreter escape stays contained.

mod child_main;
mod executor;
mod fitness_eval;
#[cfg(target_os = "linux")]
mod hardening;

pub use executor::SandboxConfig;
pub use executor::SandboxError;
pub use executor::SandboxExecutor;

/// Entry point for the `opthub-sandbox` child binary.
pub fn run_main() -> ! {
    child_main::run_main()
}
