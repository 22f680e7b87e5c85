use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Upper bound on a stored error message. Anything longer is truncated so a
/// failing job cannot bloat its record (or every subscriber's event buffer)
/// with an arbitrarily large backtrace.
const MAX_ERROR_MESSAGE_LEN: usize = 4096;

/// The failure taxonomy. These kinds appear verbatim in job records, SSE
/// frames, and HTTP error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed submission, unknown algorithm or benchmark, bad parameters,
    /// or user code rejected by the static validator.
    Validation,
    /// Soft or hard deadline reached during execution.
    Timeout,
    /// The sandboxed child hit its memory or CPU ceiling.
    Resource,
    /// The isolation layer failed to launch or exited unexpectedly.
    Container,
    /// The sandboxed child produced output that could not be decoded.
    Parse,
    /// The algorithm or user code raised, or produced a non-numeric fitness.
    Runtime,
    /// The requested job id is not present (never was, or already evicted).
    UnknownJob,
}

impl ErrorKind {
    /// Transient kinds are environmental and eligible for retry. Retrying
    /// `runtime` or `validation` would re-execute user-deterministic faults.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Container | ErrorKind::Parse)
    }
}

/// Structured error stored on a FAILURE record and surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut end = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self { kind, message }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn container(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Container, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn unknown_job(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownJob, message)
    }
}
