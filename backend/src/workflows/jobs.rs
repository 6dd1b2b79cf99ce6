//! Job and JobRun: the durable execution state of a fired workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Shared status vocabulary for jobs and their runs.
///
/// `Waiting` is re-enterable (a wait action suspends, a continuation dequeue
/// resumes); `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instantiation of a workflow firing for one matched event. The trigger
/// payload is captured once at enqueue time and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub account_id: Uuid,
    pub workflow_id: Uuid,
    pub payload: Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(account_id: Uuid, workflow_id: Uuid, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            workflow_id,
            payload,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// One execution attempt of a job. Runs accumulate as an audit trail; the
/// latest attempt is authoritative for the job's execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt: i32,
    pub status: JobStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRun {
    pub fn new(job_id: Uuid, attempt: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            attempt,
            status: JobStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }
}
