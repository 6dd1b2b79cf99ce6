//! Workflow automation engine.
//!
//! Domain events flow into the [`triggers::TriggerMatcher`], which persists
//! a job per matching trigger and hands it to the queue. Each dequeue runs
//! through [`runner::WorkflowRunner`], which walks the workflow's ordered
//! actions, dispatching each via [`executor::ActionExecutor`] and gating on
//! [`expression`] conditions.

pub mod actions;
pub mod executor;
pub mod expression;
pub mod jobs;
pub mod runner;
pub mod triggers;

use thiserror::Error;

pub use actions::{Action, ActionOutcome, ActionType, Condition, Delay};
pub use executor::{ActionExecutor, ExecutionContext};
pub use jobs::{Job, JobRun, JobStatus};
pub use runner::{WorkflowDefinition, WorkflowRunner};
pub use triggers::{Trigger, TriggerMatcher};

/// Failures that abort a run. Each one is recorded on the JobRun and
/// propagated to the queue for redelivery.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown action type '{0}'")]
    UnknownActionType(String),
    #[error("branch cycle detected after {0} dispatched action(s)")]
    BranchCycle(usize),
    #[error("channel send failed: {0}")]
    ChannelSend(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error("queue error: {0}")]
    Queue(#[source] anyhow::Error),
}
