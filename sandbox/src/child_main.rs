//! Entry point for the sandboxed child process.
//!
//! Protocol: one JSON [`ChildRequest`] on stdin, one JSON [`ChildOutcome`]
//! on stdout, exit code 0. Structured user-level failures travel inside the
//! outcome; anything that prevents producing an outcome at all (bad framing,
//! hardening failure) goes to stderr with a non-zero exit so the parent can
//! classify it from the exit status.

use std::io::Read;
use std::io::Write;

use anyhow::Context;
use anyhow::Result;
#[cfg(target_os = "linux")]
use opthub_protocol::ChildOutcome;
use opthub_protocol::ChildRequest;

#[cfg(target_os = "linux")]
use crate::fitness_eval::run_user_optimization;

pub(crate) fn run_main() -> ! {
    match child_main() {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            // Stderr only; stdout is reserved for the outcome document.
            let _ = writeln!(std::io::stderr(), "opthub-sandbox: {err:#}");
            std::process::exit(1);
        }
    }
}

fn child_main() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read request from stdin")?;
    let request: ChildRequest =
        serde_json::from_str(&input).context("failed to decode request from stdin")?;

    let scratch = std::env::current_dir().context("failed to resolve scratch directory")?;

    #[cfg(target_os = "linux")]
    crate::hardening::apply(&request.limits, &scratch).context("failed to harden the sandbox")?;
    #[cfg(not(target_os = "linux"))]
    anyhow::bail!(
        "opthub-sandbox requires Linux isolation primitives (scratch: {})",
        scratch.display()
    );

    #[cfg(target_os = "linux")]
    {
        let source = std::fs::read_to_string(&request.source_path)
            .with_context(|| format!("failed to read {}", request.source_path.display()))?;

        let outcome = match run_user_optimization(&source, &request.spec) {
            Ok(result) => ChildOutcome::Result { result },
            Err(error) => ChildOutcome::Error { error },
        };

        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer(&mut handle, &outcome).context("failed to write outcome")?;
        handle.flush().context("failed to flush outcome")?;
        Ok(())
    }
}
