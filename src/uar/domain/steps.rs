//! Contract objects passed into and produced by workflow steps.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Step,
    Agent,
    Team,
    Task,
    Sequence,
    Loop,
    LoopIteration,
    Router,
    Condition,
}

/// Result of one step. Composites carry their children's outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepOutput {
    pub step_name: String,
    #[serde(default)]
    pub step_type: StepType,
    pub content: Option<String>,
    pub success: bool,
    /// Ends the enclosing composite (and the run) after this output.
    #[serde(default)]
    pub stop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepOutput>,
}

impl StepOutput {
    /// A successful output; the engine fills in the step name.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            success: true,
            ..Self::default()
        }
    }

    /// A successful output that also requests early termination.
    pub fn stop_with(content: impl Into<String>) -> Self {
        Self::new(content).with_stop()
    }

    #[must_use]
    pub fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    pub fn failed(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Depth-first iterator over this output and every nested child.
    pub fn walk(&self) -> Vec<&StepOutput> {
        let mut all = vec![self];
        for child in &self.children {
            all.extend(child.walk());
        }
        all
    }
}

/// Content of an earlier run in the same session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub run_id: String,
    pub input: String,
    pub content: Option<String>,
}

/// Shared, mutable session state visible to every step of a run.
///
/// Concurrent runs against the same session race; callers serialize them.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl SessionState {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Input handed to a step.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub input: String,
    pub previous_step_content: Option<String>,
    /// Content of every prior step in the run, keyed by step name.
    pub previous_step_outputs: BTreeMap<String, String>,
    /// Caller-supplied data, passed through untouched.
    pub additional_data: Arc<Value>,
    pub session_state: SessionState,
    /// Earlier runs of the session; empty unless the step opted in.
    pub history: Vec<HistoryEntry>,
}

impl StepInput {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            previous_step_content: None,
            previous_step_outputs: BTreeMap::new(),
            additional_data: Arc::new(Value::Null),
            session_state: SessionState::default(),
            history: Vec::new(),
        }
    }

    /// The previous step's content, falling back to the run input.
    pub fn latest_content(&self) -> &str {
        self.previous_step_content.as_deref().unwrap_or(&self.input)
    }

    pub fn step_content(&self, step_name: &str) -> Option<&str> {
        self.previous_step_outputs.get(step_name).map(String::as_str)
    }
}
