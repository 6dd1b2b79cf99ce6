//! Action model: the nine step variants a workflow can contain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// The closed set of executable action variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendEmail,
    SendSms,
    CreateTask,
    AddNote,
    UpdateContact,
    MoveOpportunity,
    Webhook,
    Wait,
    Branch,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::SendSms => "send_sms",
            Self::CreateTask => "create_task",
            Self::AddNote => "add_note",
            Self::UpdateContact => "update_contact",
            Self::MoveOpportunity => "move_opportunity",
            Self::Webhook => "webhook",
            Self::Wait => "wait",
            Self::Branch => "branch",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "send_email" => Some(Self::SendEmail),
            "send_sms" => Some(Self::SendSms),
            "create_task" => Some(Self::CreateTask),
            "add_note" => Some(Self::AddNote),
            "update_contact" => Some(Self::UpdateContact),
            "move_opportunity" => Some(Self::MoveOpportunity),
            "webhook" => Some(Self::Webhook),
            "wait" => Some(Self::Wait),
            "branch" => Some(Self::Branch),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean gate attached to an action. Evaluated at run time, never
/// pre-compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub expression: String,
}

/// Declarative pre-execution delay on an action. Served through the same
/// suspend/resume protocol as the `wait` action type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delay {
    /// minutes, hours or days
    pub delay_type: String,
    pub delay_value: i64,
}

impl Delay {
    pub fn as_duration(&self) -> Duration {
        let unit_secs: u64 = match self.delay_type.as_str() {
            "hours" => 3_600,
            "days" => 86_400,
            _ => 60, // minutes, also the fallback for unknown units
        };
        Duration::from_secs(self.delay_value.max(0) as u64 * unit_secs)
    }
}

/// One step in a workflow's ordered action list.
///
/// `kind` is stored as the raw tag and parsed at dispatch time, so an action
/// row with an unrecognized tag is a data-integrity failure for that job
/// rather than something the type system papers over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub kind: String,
    /// Position in the workflow's linear sequence, unique per workflow.
    pub order: i32,
    /// Free-form configuration whose shape depends on `kind`.
    pub config: Value,
    pub condition: Option<Condition>,
    pub delay: Option<Delay>,
    pub created_at: DateTime<Utc>,
}

impl Action {
    pub fn new(workflow_id: Uuid, kind: ActionType, order: i32, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            kind: kind.as_str().to_string(),
            order,
            config,
            condition: None,
            delay: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(Condition {
            expression: expression.into(),
        });
        self
    }

    pub fn with_delay(mut self, delay_type: impl Into<String>, delay_value: i64) -> Self {
        self.delay = Some(Delay {
            delay_type: delay_type.into(),
            delay_value,
        });
        self
    }
}

/// What an executor reports back to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action ran (or was a best-effort no-op like webhook delivery).
    Completed,
    /// Required input was missing; the action was logged and skipped.
    Skipped { reason: &'static str },
    /// A delayed continuation was scheduled; the runner must stop here.
    Suspended,
    /// A branch evaluated; `next_action_id` is the jump target, if any.
    Branched { next_action_id: Option<Uuid> },
}
