//! Job data model and state machine.
//!
//! ```text
//! Created → AwaitingMail → RunningWorkflow → Finalizing → Succeeded
//!                │                │
//!                ▼                ▼
//!            TimedOut           Failed
//! ```
//!
//! `RunningWorkflow → RunningWorkflow` is the only permitted self-transition
//! (a timed retry of the browser workflow).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::Workflow;

/// Opaque, caller-visible job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    AwaitingMail,
    RunningWorkflow,
    Finalizing,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    /// Position in the state machine. Terminal states share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::AwaitingMail => 1,
            JobStatus::RunningWorkflow => 2,
            JobStatus::Finalizing => 3,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, AwaitingMail)
                | (Created, Failed)
                | (AwaitingMail, RunningWorkflow)
                | (AwaitingMail, TimedOut)
                | (AwaitingMail, Failed)
                | (RunningWorkflow, RunningWorkflow)
                | (RunningWorkflow, Finalizing)
                | (RunningWorkflow, Failed)
                | (Finalizing, Succeeded)
                | (Finalizing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::AwaitingMail => "awaiting_mail",
            JobStatus::RunningWorkflow => "running_workflow",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended without success.
///
/// Capacity problems (`PoolExhausted`, `PoolUnavailable`) are kept distinct
/// from workflow problems so callers can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MailTimeout,
    Cancelled,
    PoolExhausted,
    PoolUnavailable,
    StepFailed,
    AttemptsExhausted,
    ResultMissing,
    OrchestratorRestarted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Final output of a successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Payload extracted from the triggering mail.
    pub payload: String,
    /// Values captured by `extract` actions, keyed by name.
    pub extracted: std::collections::BTreeMap<String, String>,
}

/// Read-mostly view of a job, as held by the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub correlation_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

/// A job as owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub workflow: Workflow,
    pub correlation_key: String,
    /// Shared-cookie key, if the job asked for one.
    pub session_key: Option<String>,
    pub attempt: u32,
    pub last_error: Option<JobFailure>,
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(id: JobId, workflow: Workflow, correlation_key: String) -> Self {
        Self {
            id,
            status: JobStatus::Created,
            created_at: Utc::now(),
            workflow,
            correlation_key,
            session_key: None,
            attempt: 0,
            last_error: None,
            result: None,
        }
    }

    /// Move to `next`, returning `false` (and leaving the job untouched) if
    /// the transition is not allowed by the state machine.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn fail(&mut self, status: JobStatus, failure: JobFailure) -> bool {
        if !self.advance(status) {
            return false;
        }
        self.last_error = Some(failure);
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            status: self.status,
            correlation_key: self.correlation_key.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            attempt: self.attempt,
            error: self.last_error.clone(),
            result: self.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Action;

    fn job() -> Job {
        let workflow = Workflow::new(vec![Action::Navigate {
            url: "https://example.com".to_string(),
        }]);
        Job::new(JobId::from("job-1"), workflow, "job-1".to_string())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job();
        assert!(job.advance(JobStatus::AwaitingMail));
        assert!(job.advance(JobStatus::RunningWorkflow));
        assert!(job.advance(JobStatus::RunningWorkflow));
        assert!(job.advance(JobStatus::Finalizing));
        assert!(job.advance(JobStatus::Succeeded));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::TimedOut] {
            for next in [
                JobStatus::Created,
                JobStatus::AwaitingMail,
                JobStatus::RunningWorkflow,
                JobStatus::Finalizing,
                JobStatus::Failed,
            ] {
                assert!(!terminal.can_advance_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_timed_out_only_from_awaiting_mail() {
        assert!(JobStatus::AwaitingMail.can_advance_to(JobStatus::TimedOut));
        assert!(!JobStatus::RunningWorkflow.can_advance_to(JobStatus::TimedOut));
        assert!(!JobStatus::TimedOut.can_advance_to(JobStatus::RunningWorkflow));
    }

    #[test]
    fn test_advance_rejects_regression() {
        let mut job = job();
        job.advance(JobStatus::AwaitingMail);
        job.advance(JobStatus::RunningWorkflow);
        assert!(!job.advance(JobStatus::AwaitingMail));
        assert_eq!(job.status, JobStatus::RunningWorkflow);
    }

    #[test]
    fn test_fail_records_error() {
        let mut job = job();
        job.advance(JobStatus::AwaitingMail);
        assert!(job.fail(
            JobStatus::TimedOut,
            JobFailure::new(FailureReason::MailTimeout, "no mail")
        ));
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::TimedOut);
        assert_eq!(snapshot.error.unwrap().reason, FailureReason::MailTimeout);
    }

    #[test]
    fn test_snapshot_serialization() {
        let job = job();
        let json = serde_json::to_value(job.snapshot()).unwrap();
        assert_eq!(json["job_id"], "job-1");
        assert_eq!(json["status"], "created");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }
}
