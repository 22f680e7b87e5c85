//! Types shared by every opthub crate: the problem and job data model, the
//! result record, the error taxonomy, and the stdio framing spoken between
//! the sandbox parent and child.
//!
//! This crate is deliberately light on dependencies so the sandbox child
//! binary can link it without pulling in the server stack.

mod error;
mod job;
mod problem;
mod result;
mod sandbox;

pub use error::ErrorKind;
pub use error::JobError;
pub use job::GroupId;
pub use job::JobId;
pub use job::JobRecord;
pub use job::JobState;
pub use problem::FitnessSelector;
pub use problem::KnapsackData;
pub use problem::Objective;
pub use problem::ProblemDescriptor;
pub use problem::TspData;
pub use result::OptimizationResult;
pub use sandbox::ChildOutcome;
pub use sandbox::ChildRequest;
pub use sandbox::SandboxJobSpec;
pub use sandbox::SandboxLimits;
