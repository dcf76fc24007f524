use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RunFault;
use crate::uar::domain::steps::StepOutput;

/// What kind of entity a run executes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    Agent,
    Team,
    Workflow,
}

impl OwnerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Team => "team",
            Self::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for OwnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Error)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `paused` may still complete: a step that was already in flight when
    /// the gate closed is allowed to finish the run.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::{Cancelled, Completed, Error, Paused, Pending, Running};
        matches!(
            (self, next),
            (Pending, Running | Cancelled | Error)
                | (Running, Completed | Error | Cancelled | Paused)
                | (Paused, Running | Cancelled | Error | Completed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub status: RunStatus,
    pub input: String,
    pub content: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub step_outputs: Vec<StepOutput>,
    /// Free-form metadata; the only field that may change after a terminal state.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        run_id: impl Into<String>,
        owner_type: OwnerType,
        owner_id: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            owner_type,
            owner_id: owner_id.into(),
            session_id: None,
            user_id: None,
            status: RunStatus::Pending,
            input: input.into(),
            content: None,
            error: None,
            step_outputs: Vec::new(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the record to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), RunFault> {
        if !self.status.can_transition_to(next) {
            return Err(RunFault::Validation(format!(
                "run {} cannot move from {} to {}",
                self.run_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Check that replacing `self` with `next` keeps a terminal record intact.
    pub fn check_overwrite(&self, next: &RunRecord) -> Result<(), RunFault> {
        if !self.status.is_terminal() {
            return Ok(());
        }
        let unchanged = self.status == next.status
            && self.content == next.content
            && self.error == next.error
            && self.step_outputs == next.step_outputs
            && self.input == next.input;
        if unchanged {
            Ok(())
        } else {
            Err(RunFault::Validation(format!(
                "run {} is {} and can no longer be modified",
                self.run_id, self.status
            )))
        }
    }
}

/// Returned by background dispatch; the run continues detached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunHandle {
    pub run_id: String,
    pub session_id: Option<String>,
    pub status: RunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut run = RunRecord::new("r1", OwnerType::Agent, "echo", "hi");
        assert!(run.transition(RunStatus::Completed).is_err());
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Paused).unwrap();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Completed).unwrap();
        assert!(run.transition(RunStatus::Running).is_err());
        assert!(run.transition(RunStatus::Cancelled).is_err());
    }

    #[test]
    fn test_cancel_before_start_is_legal() {
        let mut run = RunRecord::new("r1", OwnerType::Workflow, "wf", "hi");
        run.transition(RunStatus::Cancelled).unwrap();
        assert!(run.status.is_terminal());
    }

    #[test]
    fn test_terminal_record_only_accepts_metadata_changes() {
        let mut run = RunRecord::new("r1", OwnerType::Team, "crew", "hi");
        run.transition(RunStatus::Running).unwrap();
        run.content = Some("done".to_string());
        run.transition(RunStatus::Completed).unwrap();

        let mut with_metadata = run.clone();
        with_metadata
            .metadata
            .insert("archived".to_string(), serde_json::json!(true));
        assert!(run.check_overwrite(&with_metadata).is_ok());

        let mut rewritten = run.clone();
        rewritten.content = Some("other".to_string());
        assert!(run.check_overwrite(&rewritten).is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
