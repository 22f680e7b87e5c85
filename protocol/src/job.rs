use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::JobError;
use crate::problem::ProblemDescriptor;
use crate::result::OptimizationResult;

/// Opaque identifier for one job, issued at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier shared by all jobs of one multi-algorithm submission. The
/// group has no aggregate state; clients observe each job independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a job. Wire format matches the classic task-queue
/// convention of upper-case state names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Started,
    Success,
    Failure,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    /// State is monotonic: PENDING -> STARTED -> {SUCCESS | FAILURE}, and
    /// terminal states never change.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            JobState::Pending => matches!(
                next,
                JobState::Started | JobState::Success | JobState::Failure
            ),
            JobState::Started => matches!(next, JobState::Success | JobState::Failure),
            JobState::Success | JobState::Failure => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// The authoritative record for one job, owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub group_id: GroupId,
    pub algorithm: String,
    pub problem: ProblemDescriptor,
    pub params: BTreeMap<String, f64>,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OptimizationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl JobRecord {
    pub fn pending(
        id: JobId,
        group_id: GroupId,
        algorithm: impl Into<String>,
        problem: ProblemDescriptor,
        params: BTreeMap<String, f64>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            group_id,
            algorithm: algorithm.into(),
            problem,
            params,
            state: JobState::Pending,
            result: None,
            error: None,
            submitted_at,
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JobState;
    use pretty_assertions::assert_eq;

    #[test]
    fn states_serialize_upper_case() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&JobState::Pending)?, "\"PENDING\"");
        assert_eq!(serde_json::to_string(&JobState::Started)?, "\"STARTED\"");
        assert_eq!(serde_json::to_string(&JobState::Success)?, "\"SUCCESS\"");
        assert_eq!(serde_json::to_string(&JobState::Failure)?, "\"FAILURE\"");
        Ok(())
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [JobState::Success, JobState::Failure] {
            for next in [
                JobState::Pending,
                JobState::Started,
                JobState::Success,
                JobState::Failure,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn fast_jobs_may_fuse_pending_into_terminal() {
        assert!(JobState::Pending.can_transition_to(JobState::Success));
        assert!(JobState::Pending.can_transition_to(JobState::Failure));
        assert!(JobState::Started.can_transition_to(JobState::Failure));
        assert!(!JobState::Started.can_transition_to(JobState::Pending));
        assert!(!JobState::Pending.is_terminal());
    }
}
