use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::uar::domain::runs::{OwnerType, RunStatus};
use crate::uar::domain::steps::StepType;

/// Observable change in a run, serialized as `{event_type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted {
        owner_type: OwnerType,
        owner_id: String,
    },
    ContentDelta {
        text_delta: String,
        step_name: Option<String>,
    },
    StepStarted {
        step_name: String,
        step_type: StepType,
    },
    StepCompleted {
        step_name: String,
        step_type: StepType,
        success: bool,
        stop: bool,
    },
    ToolStarted {
        tool_call_id: String,
        tool: String,
        input: serde_json::Value,
    },
    ToolCompleted {
        tool_call_id: String,
        tool: String,
        output: serde_json::Value,
        ok: bool,
    },
    RunPaused {},
    RunResumed {},
    RunCompleted {
        content: Option<String>,
    },
    RunCancelled {
        content: Option<String>,
    },
    RunError {
        error: String,
    },
}

impl RunEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::ContentDelta { .. } => "content_delta",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::RunPaused {} => "run_paused",
            Self::RunResumed {} => "run_resumed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::RunError { .. } => "run_error",
        }
    }

    /// Status a terminal event settles the run in, `None` for progress events.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            Self::RunCompleted { .. } => Some(RunStatus::Completed),
            Self::RunCancelled { .. } => Some(RunStatus::Cancelled),
            Self::RunError { .. } => Some(RunStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }
}

/// One indexed entry of a run's event log.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunEvent {
    pub run_id: String,
    pub event_index: u64,
    #[serde(flatten)]
    pub kind: RunEventKind,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_and_payload() {
        let event = RunEvent {
            run_id: "r1".to_string(),
            event_index: 3,
            kind: RunEventKind::ContentDelta {
                text_delta: "hi".to_string(),
                step_name: None,
            },
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_index"], 3);
        assert_eq!(json["event_type"], "content_delta");
        assert_eq!(json["payload"]["text_delta"], "hi");
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let kind = RunEventKind::RunPaused {};
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["event_type"], kind.event_type());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(RunEventKind::RunError { error: "x".into() }.is_terminal());
        assert!(!RunEventKind::RunResumed {}.is_terminal());
        assert_eq!(
            RunEventKind::RunCancelled { content: None }.terminal_status(),
            Some(RunStatus::Cancelled)
        );
    }
}
