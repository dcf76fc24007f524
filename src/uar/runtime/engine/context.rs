use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ExpressionError;
use crate::uar::domain::events::{RunEvent, RunEventKind};
use crate::uar::domain::steps::HistoryEntry;
use crate::uar::runtime::cancellation::CancellationRegistry;
use crate::uar::runtime::event_log::RunEventLog;

/// Why a run stopped before its steps were exhausted.
///
/// Executors return it through `anyhow` (usually via `ctx.checkpoint().await?`);
/// the engine downcasts it back out so it is never mistaken for a step failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Interrupt {
    #[error("run was cancelled")]
    Cancelled,
    #[error("run timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Per-run state shared by every step of the run.
#[derive(Debug)]
pub struct RunScope {
    pub run_id: String,
    events: RunEventLog,
    cancellation: CancellationRegistry,
    deadline: Option<(Instant, Duration)>,
    pause: Option<watch::Receiver<bool>>,
    poll_interval: Duration,
    history: Vec<HistoryEntry>,
}

impl RunScope {
    pub fn new(
        run_id: impl Into<String>,
        events: RunEventLog,
        cancellation: CancellationRegistry,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            events,
            cancellation,
            deadline: None,
            pause: None,
            poll_interval: Duration::from_millis(250),
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| (Instant::now() + t, t));
        self
    }

    /// Hold at checkpoints while the receiver reads `true`.
    #[must_use]
    pub fn with_pause_gate(mut self, pause: watch::Receiver<bool>, poll_interval: Duration) -> Self {
        self.pause = Some(pause);
        self.poll_interval = poll_interval;
        self
    }

    /// Earlier runs of the session, oldest first.
    #[must_use]
    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.history = history;
        self
    }

    /// The most recent `limit` history entries.
    pub fn recent_history(&self, limit: usize) -> Vec<HistoryEntry> {
        let skip = self.history.len().saturating_sub(limit);
        self.history[skip..].to_vec()
    }

    pub fn emit(&self, kind: RunEventKind) -> Option<RunEvent> {
        self.events.append(&self.run_id, kind)
    }

    /// Suspension point: raise a pending timeout or cancellation, and wait
    /// here while the run is paused.
    pub async fn checkpoint(&self) -> Result<(), Interrupt> {
        self.check_interrupts().await?;

        let Some(pause) = &self.pause else {
            return Ok(());
        };
        let mut pause = pause.clone();
        while *pause.borrow_and_update() {
            tracing::debug!(run_id = %self.run_id, "Run paused at checkpoint");
            match tokio::time::timeout(self.poll_interval, pause.changed()).await {
                // Gate dropped with the manager; nothing can resume us anymore.
                Ok(Err(_)) => break,
                Ok(Ok(())) | Err(_) => {}
            }
            self.check_interrupts().await?;
        }
        Ok(())
    }

    async fn check_interrupts(&self) -> Result<(), Interrupt> {
        if let Some((deadline, timeout)) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Interrupt::TimedOut(timeout));
        }
        match self.cancellation.is_cancelled(&self.run_id).await {
            Ok(true) => Err(Interrupt::Cancelled),
            Ok(false) => Ok(()),
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "Cancellation check failed; continuing");
                Ok(())
            }
        }
    }
}

/// A callable tool a step can invoke through [`StepContext::call_tool`].
#[async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn call(&self, input: Value) -> anyhow::Result<Value>;
}

/// Handle given to a step while it executes.
#[derive(Debug, Clone)]
pub struct StepContext {
    scope: Arc<RunScope>,
    step_name: String,
}

impl StepContext {
    pub fn new(scope: Arc<RunScope>, step_name: impl Into<String>) -> Self {
        Self {
            scope,
            step_name: step_name.into(),
        }
    }

    /// Context for work nested under this step, e.g. one task of a team.
    pub fn child(&self, step_name: impl Into<String>) -> Self {
        Self::new(Arc::clone(&self.scope), step_name)
    }

    pub fn run_id(&self) -> &str {
        &self.scope.run_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn scope(&self) -> &Arc<RunScope> {
        &self.scope
    }

    pub fn emit(&self, kind: RunEventKind) {
        self.scope.emit(kind);
    }

    /// Stream a piece of content produced by this step.
    pub fn emit_delta(&self, text: impl Into<String>) {
        self.emit(RunEventKind::ContentDelta {
            text_delta: text.into(),
            step_name: Some(self.step_name.clone()),
        });
    }

    pub async fn checkpoint(&self) -> Result<(), Interrupt> {
        self.scope.checkpoint().await
    }

    /// Run one tool call framed by `tool_started` / `tool_completed`.
    pub async fn call_tool(&self, tool: &dyn Tool, input: Value) -> anyhow::Result<Value> {
        self.checkpoint().await?;

        let tool_call_id = Uuid::new_v4().to_string();
        self.emit(RunEventKind::ToolStarted {
            tool_call_id: tool_call_id.clone(),
            tool: tool.name().to_string(),
            input: input.clone(),
        });

        let result = tool.call(input).await;
        let (output, ok) = match &result {
            Ok(value) => (value.clone(), true),
            Err(e) => (Value::String(format!("{e:#}")), false),
        };
        self.emit(RunEventKind::ToolCompleted {
            tool_call_id,
            tool: tool.name().to_string(),
            output,
            ok,
        });
        result
    }

    /// Run independent tool calls concurrently; results keep the call order.
    pub async fn call_tools(&self, calls: Vec<(Arc<dyn Tool>, Value)>) -> Vec<anyhow::Result<Value>> {
        let futures = calls
            .iter()
            .map(|(tool, input)| self.call_tool(tool.as_ref(), input.clone()));
        futures::future::join_all(futures).await
    }
}
