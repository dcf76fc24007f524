use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLockReadGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::{Instrument, instrument};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{Result, RunFault};
use crate::uar::domain::events::{RunEvent, RunEventKind};
use crate::uar::domain::runs::{OwnerType, RunHandle, RunRecord, RunStatus};
use crate::uar::domain::session::SessionRecord;
use crate::uar::domain::steps::{HistoryEntry, SessionState, StepInput};
use crate::uar::persistence::RunStore;
use crate::uar::runtime::cancellation::CancellationRegistry;
use crate::uar::runtime::engine::{
    ExecutorRegistry, Interrupt, Invocable, RunScope, Step, StepEngine, StepExecutor, Workflow,
    WorkflowOutcome, WorkflowSpec,
};
use crate::uar::runtime::event_log::RunEventLog;
use crate::uar::runtime::expression::ExpressionEngine;

// =============================================================================
// Dispatch contract
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// The caller waits for the terminal record.
    #[default]
    Sync,
    /// The caller consumes events while the run executes on its own task.
    Stream,
    /// The run is persisted as pending and continues detached.
    Background,
}

impl DispatchMode {
    pub fn from_flags(stream: bool, background: bool) -> Result<Self> {
        match (stream, background) {
            (true, true) => Err(RunFault::Validation(
                "stream and background cannot be combined".to_string(),
            )),
            (true, false) => Ok(Self::Stream),
            (false, true) => Ok(Self::Background),
            (false, false) => Ok(Self::Sync),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Stream => "stream",
            Self::Background => "background",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub input: String,
    pub mode: DispatchMode,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Handed to every step untouched.
    pub additional_data: Value,
    /// Overrides the configured default.
    pub timeout: Option<Duration>,
}

impl DispatchRequest {
    pub fn new(owner_type: OwnerType, owner_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            owner_type,
            owner_id: owner_id.into(),
            input: input.into(),
            mode: DispatchMode::Sync,
            run_id: None,
            session_id: None,
            user_id: None,
            additional_data: Value::Null,
            timeout: None,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn additional_data(mut self, data: Value) -> Self {
        self.additional_data = data;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What `dispatch` hands back, depending on the mode.
#[derive(Debug)]
pub enum Dispatched {
    Completed(RunRecord),
    Stream(RunEventStream),
    Background(RunHandle),
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub default_timeout: Option<Duration>,
    pub pause_poll: Duration,
    /// Frames buffered per streaming subscriber.
    pub event_channel_capacity: usize,
    /// Finished event logs are dropped after this long; `None` keeps them.
    pub event_retention: Option<Duration>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(600)),
            pause_poll: Duration::from_millis(250),
            event_channel_capacity: 256,
            event_retention: Some(Duration::from_secs(3600)),
        }
    }
}

impl From<&RuntimeConfig> for RuntimeSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            default_timeout: config.default_timeout(),
            pause_poll: config.pause_poll(),
            event_channel_capacity: config.event_channel_capacity.max(1),
            event_retention: config.event_retention(),
        }
    }
}

// =============================================================================
// Run manager
// =============================================================================

#[derive(Debug)]
struct ActiveRun {
    record: RunRecord,
    pause: watch::Sender<bool>,
    started: Instant,
}

struct PreparedRun {
    record: RunRecord,
    workflow: Arc<Workflow>,
    input: StepInput,
    session: Option<SessionRecord>,
    history: Vec<HistoryEntry>,
    timeout: Option<Duration>,
    pause: watch::Receiver<bool>,
}

#[derive(Clone, Debug)]
pub struct RunManager {
    // run_id -> record and pause gate of every run not yet terminal
    active_runs: Arc<RwLock<HashMap<String, ActiveRun>>>,
    registry: Arc<std::sync::RwLock<ExecutorRegistry>>,
    cancellation: CancellationRegistry,
    events: RunEventLog,
    engine: StepEngine,
    expressions: ExpressionEngine,
    settings: RuntimeSettings,
    // Persistence layer (optional)
    pub persistence: Option<Arc<dyn RunStore>>,
}

impl RunManager {
    pub fn new(
        cancellation: CancellationRegistry,
        persistence: Option<Arc<dyn RunStore>>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            active_runs: Arc::new(RwLock::new(HashMap::new())),
            registry: Arc::new(std::sync::RwLock::new(ExecutorRegistry::new())),
            cancellation,
            events: RunEventLog::new(),
            engine: StepEngine::new(),
            expressions: ExpressionEngine::default(),
            settings,
            persistence,
        }
    }

    #[must_use]
    pub fn with_expressions(mut self, expressions: ExpressionEngine) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn events(&self) -> &RunEventLog {
        &self.events
    }

    pub fn cancellation(&self) -> &CancellationRegistry {
        &self.cancellation
    }

    pub fn expressions(&self) -> &ExpressionEngine {
        &self.expressions
    }

    // ----- Registration -----------------------------------------------------

    pub fn register_agent(&self, id: impl Into<String>, agent: Arc<dyn Invocable>) {
        self.registry_mut().register_agent(id, agent);
    }

    pub fn register_team(&self, id: impl Into<String>, team: Arc<dyn Invocable>) {
        self.registry_mut().register_team(id, team);
    }

    pub fn register_executor(&self, id: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.registry_mut().register_executor(id, executor);
    }

    pub fn register_workflow(&self, workflow: Workflow) {
        tracing::info!(workflow = %workflow.name, steps = workflow.steps.len(), "Workflow registered");
        self.registry_mut().register_workflow(workflow);
    }

    /// Compile a declarative workflow against what is registered so far.
    pub fn register_workflow_spec(&self, spec: &WorkflowSpec) -> Result<()> {
        let workflow = spec.compile(&self.registry(), &self.expressions)?;
        self.register_workflow(workflow);
        Ok(())
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.registry().workflow_names()
    }

    fn registry(&self) -> RwLockReadGuard<'_, ExecutorRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, ExecutorRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ----- Dispatch ---------------------------------------------------------

    #[instrument(
        skip(self, request),
        fields(
            owner_type = %request.owner_type,
            owner_id = %request.owner_id,
            mode = request.mode.as_str(),
            run_id = tracing::field::Empty
        )
    )]
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Dispatched> {
        let mode = request.mode;
        if mode == DispatchMode::Background && self.persistence.is_none() {
            return Err(RunFault::Validation(
                "background dispatch requires a run store".to_string(),
            ));
        }

        // Own task, so a caller that goes away never strands a claimed or
        // half-finished run.
        let manager = self.clone();
        tokio::spawn(async move { manager.launch(request).await }.in_current_span())
            .await
            .map_err(|e| RunFault::Execution(format!("run task failed: {e}")))?
    }

    async fn launch(&self, request: DispatchRequest) -> Result<Dispatched> {
        let mode = request.mode;
        let prepared = self.prepare(request).await?;
        let run_id = prepared.record.run_id.clone();
        tracing::Span::current().record("run_id", run_id.as_str());
        metrics::counter!(
            "uar_runs_dispatched_total",
            "owner_type" => prepared.record.owner_type.as_str(),
            "mode" => mode.as_str()
        )
        .increment(1);
        tracing::info!("Run dispatched");

        match mode {
            DispatchMode::Sync => self.execute(prepared).await.map(Dispatched::Completed),
            DispatchMode::Stream => {
                let subscription = self
                    .events
                    .subscribe(&run_id, 0)
                    .ok_or_else(|| RunFault::NotFound(run_id.clone()))?;
                self.spawn(prepared);
                Ok(Dispatched::Stream(RunEventStream::new(
                    run_id,
                    subscription.into_stream().boxed(),
                    self.cancellation.clone(),
                )))
            }
            DispatchMode::Background => {
                let handle = RunHandle {
                    run_id,
                    session_id: prepared.record.session_id.clone(),
                    status: prepared.record.status,
                };
                self.spawn(prepared);
                Ok(Dispatched::Background(handle))
            }
        }
    }

    fn spawn(&self, prepared: PreparedRun) {
        let manager = self.clone();
        tokio::spawn(async move {
            let run_id = prepared.record.run_id.clone();
            if let Err(e) = manager.execute(prepared).await {
                tracing::error!(run_id = %run_id, error = %e, "Detached run could not be settled");
            }
        });
    }

    fn resolve(&self, owner_type: OwnerType, owner_id: &str) -> Result<Arc<Workflow>> {
        let registry = self.registry();
        let single = |step: Step| Arc::new(Workflow::new(owner_id, vec![step]));
        let found = match owner_type {
            OwnerType::Workflow => registry.workflow(owner_id),
            OwnerType::Agent => registry.agent(owner_id).map(|a| single(Step::agent(owner_id, a))),
            OwnerType::Team => registry.team(owner_id).map(|t| single(Step::team(owner_id, t))),
        };
        found.ok_or_else(|| RunFault::Validation(format!("unknown {owner_type} '{owner_id}'")))
    }

    /// Validate, persist the pending record, and register for cancellation.
    async fn prepare(&self, request: DispatchRequest) -> Result<PreparedRun> {
        if request.owner_id.trim().is_empty() {
            return Err(RunFault::Validation("owner_id must not be empty".to_string()));
        }
        let workflow = self.resolve(request.owner_type, &request.owner_id)?;

        let run_id = request
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut record = RunRecord::new(
            run_id.clone(),
            request.owner_type,
            request.owner_id,
            request.input,
        );
        record.session_id = Some(session_id);
        record.user_id = request.user_id;

        let pause = self.reserve(&record).await?;
        let prepared = self
            .hydrate(record, workflow, request.additional_data, request.timeout, pause)
            .await;
        if prepared.is_err() {
            self.active_runs.write().await.remove(&run_id);
        }
        prepared
    }

    /// Claim the run id among live runs. Check and insert share one write lock.
    async fn reserve(&self, record: &RunRecord) -> Result<watch::Receiver<bool>> {
        let mut runs = self.active_runs.write().await;
        if runs.contains_key(&record.run_id) || self.events.contains(&record.run_id) {
            return Err(RunFault::Validation(format!(
                "run '{}' already exists",
                record.run_id
            )));
        }
        let (pause_tx, pause_rx) = watch::channel(false);
        runs.insert(
            record.run_id.clone(),
            ActiveRun {
                record: record.clone(),
                pause: pause_tx,
                started: Instant::now(),
            },
        );
        Ok(pause_rx)
    }

    /// Load session state and history, then make the reserved run durable.
    async fn hydrate(
        &self,
        mut record: RunRecord,
        workflow: Arc<Workflow>,
        additional_data: Value,
        timeout: Option<Duration>,
        pause: watch::Receiver<bool>,
    ) -> Result<PreparedRun> {
        let run_id = record.run_id.clone();
        let session_id = record.session_id.clone().unwrap_or_default();

        let mut session = None;
        let mut history = Vec::new();
        if let Some(store) = &self.persistence {
            if store
                .load_run(&run_id)
                .await
                .map_err(|e| RunFault::persistence(&e))?
                .is_some()
            {
                return Err(RunFault::Validation(format!("run '{run_id}' already exists")));
            }

            let fresh = SessionRecord::new(
                session_id.clone(),
                record.owner_type,
                record.owner_id.clone(),
                record.user_id.clone(),
            );
            session = Some(
                store
                    .read_or_create_session(fresh)
                    .await
                    .map_err(|e| RunFault::persistence(&e))?,
            );
            let depth = workflow.history_depth();
            if depth > 0 {
                history = store
                    .list_session_runs(&session_id, depth)
                    .await
                    .map_err(|e| RunFault::persistence(&e))?
                    .into_iter()
                    .map(|r| HistoryEntry {
                        run_id: r.run_id,
                        input: r.input,
                        content: r.content,
                    })
                    .collect();
            }
        }

        let mut input = StepInput::new(record.input.clone());
        input.additional_data = Arc::new(additional_data);
        input.session_state = SessionState::new(
            session
                .as_ref()
                .map(|s| s.session_state.clone())
                .unwrap_or_default(),
        );

        // First durable write is the pending record.
        self.save(&record).await?;
        if let Err(e) = self.cancellation.register_run(&run_id).await {
            let fault = RunFault::persistence(&e);
            record.error = Some(fault.to_string());
            record.transition(RunStatus::Error)?;
            self.save(&record).await?;
            return Err(fault);
        }
        self.events.open(&run_id);

        Ok(PreparedRun {
            record,
            workflow,
            input,
            session,
            history,
            timeout,
            pause,
        })
    }

    #[instrument(
        skip_all,
        fields(run_id = %prepared.record.run_id, owner_id = %prepared.record.owner_id)
    )]
    async fn execute(&self, prepared: PreparedRun) -> Result<RunRecord> {
        let PreparedRun {
            record,
            workflow,
            input,
            session,
            history,
            timeout,
            pause,
        } = prepared;
        let run_id = record.run_id.clone();
        let session_state = input.session_state.clone();

        self.events.append(
            &run_id,
            RunEventKind::RunStarted {
                owner_type: record.owner_type,
                owner_id: record.owner_id.clone(),
            },
        );

        let scope = Arc::new(
            RunScope::new(run_id.clone(), self.events.clone(), self.cancellation.clone())
                .with_timeout(timeout.or(self.settings.default_timeout))
                .with_pause_gate(pause, self.settings.pause_poll)
                .with_history(history),
        );

        // A cancel recorded before registration is honoured here.
        let early = match scope.checkpoint().await {
            Ok(()) => self
                .update_status(&run_id, RunStatus::Running)
                .await
                .err()
                .map(|e| Interrupt::Failed(e.to_string())),
            Err(interrupt) => Some(interrupt),
        };
        let outcome = match early {
            Some(interrupt) => WorkflowOutcome {
                outputs: Vec::new(),
                content: None,
                stopped: false,
                interrupt: Some(interrupt),
            },
            None => {
                tracing::info!(steps = workflow.steps.len(), "Run executing");
                self.engine.run(&workflow, input, scope).await
            }
        };

        self.finish(&run_id, outcome, session, &session_state).await
    }

    /// Settle the run: persist the terminal record, then publish the terminal event.
    async fn finish(
        &self,
        run_id: &str,
        outcome: WorkflowOutcome,
        session: Option<SessionRecord>,
        session_state: &SessionState,
    ) -> Result<RunRecord> {
        let (status, error) = match &outcome.interrupt {
            None => (RunStatus::Completed, None),
            Some(Interrupt::Cancelled) => (RunStatus::Cancelled, None),
            Some(Interrupt::TimedOut(limit)) => {
                (RunStatus::Error, Some(RunFault::Timeout(*limit).to_string()))
            }
            Some(Interrupt::Failed(message)) => (RunStatus::Error, Some(message.clone())),
            Some(Interrupt::Expression(e)) => (RunStatus::Error, Some(e.to_string())),
        };

        let active = self
            .active_runs
            .write()
            .await
            .remove(run_id)
            .ok_or_else(|| RunFault::NotFound(run_id.to_string()))?;
        let mut record = active.record;
        record.content = outcome.content;
        record.step_outputs = outcome.outputs;
        record.error = error;
        if outcome.stopped {
            record
                .metadata
                .insert("stopped_early".to_string(), Value::Bool(true));
        }
        if let Err(e) = record.transition(status) {
            tracing::error!(error = %e, "Forcing terminal status");
            record.status = status;
            record.updated_at = Utc::now();
        }

        let persisted = self.save(&record).await;
        if let (Some(store), Some(mut session)) = (&self.persistence, session) {
            session.session_state = session_state.snapshot();
            session.updated_at = Utc::now();
            if let Err(e) = store.save_session(&session).await {
                tracing::warn!(error = %e, "Failed to save session state");
            }
        }

        let terminal = match status {
            RunStatus::Completed => RunEventKind::RunCompleted {
                content: record.content.clone(),
            },
            RunStatus::Cancelled => RunEventKind::RunCancelled {
                content: record.content.clone(),
            },
            _ => RunEventKind::RunError {
                error: record.error.clone().unwrap_or_default(),
            },
        };
        self.events.append(run_id, terminal);
        self.schedule_forget(run_id);

        if let Err(e) = self.cancellation.cleanup_run(run_id).await {
            tracing::warn!(error = %e, "Failed to clean up cancellation entry");
        }

        let elapsed = active.started.elapsed();
        metrics::counter!("uar_runs_finished_total", "status" => status.as_str()).increment(1);
        metrics::histogram!("uar_run_duration_seconds").record(elapsed.as_secs_f64());
        match status {
            RunStatus::Error => tracing::warn!(
                error = record.error.as_deref().unwrap_or_default(),
                elapsed_ms = elapsed.as_millis(),
                "Run failed"
            ),
            _ => tracing::info!(status = %status, elapsed_ms = elapsed.as_millis(), "Run finished"),
        }

        persisted.map(|()| record)
    }

    /// Drop the run's event log once the retention window has passed.
    fn schedule_forget(&self, run_id: &str) {
        let Some(retention) = self.settings.event_retention else {
            return;
        };
        let events = self.events.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            events.forget(&run_id);
            tracing::debug!(run_id = %run_id, "Event log evicted");
        });
    }

    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<RunRecord> {
        let record = {
            let mut runs = self.active_runs.write().await;
            let active = runs
                .get_mut(run_id)
                .ok_or_else(|| RunFault::NotFound(run_id.to_string()))?;
            active.record.transition(status)?;
            active.record.clone()
        };
        self.save(&record).await?;
        Ok(record)
    }

    async fn save(&self, record: &RunRecord) -> Result<()> {
        if let Some(store) = &self.persistence {
            store
                .save_run(record)
                .await
                .map_err(|e| RunFault::persistence(&e))?;
        }
        Ok(())
    }

    // ----- Control ----------------------------------------------------------

    /// Request cancellation. Works before the run starts; a no-op returning
    /// `false` once the run is terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        {
            // `finish` needs the write lock to settle the run, so the flag
            // always lands before its cleanup.
            let runs = self.active_runs.read().await;
            if runs.contains_key(run_id) {
                return self
                    .cancellation
                    .cancel_run(run_id)
                    .await
                    .map_err(|e| RunFault::persistence(&e));
            }
        }

        if self.is_settled(run_id).await? {
            tracing::debug!("Cancel ignored for terminal run");
            return Ok(false);
        }
        let registered = self
            .cancellation
            .cancel_run(run_id)
            .await
            .map_err(|e| RunFault::persistence(&e))?;
        // The run may have been dispatched and settled in between.
        if self.is_settled(run_id).await? {
            self.cancellation
                .cleanup_run(run_id)
                .await
                .map_err(|e| RunFault::persistence(&e))?;
            return Ok(false);
        }
        Ok(registered)
    }

    async fn is_settled(&self, run_id: &str) -> Result<bool> {
        let in_log = self
            .events
            .snapshot(run_id)
            .is_some_and(|s| s.terminal.is_some());
        if in_log {
            return Ok(true);
        }
        Ok(self
            .get_run(run_id)
            .await?
            .is_some_and(|r| r.status.is_terminal()))
    }

    /// Hold the run at its next checkpoint until resumed or cancelled.
    #[instrument(skip(self))]
    pub async fn pause(&self, run_id: &str) -> Result<RunRecord> {
        self.set_gate(run_id, true).await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: &str) -> Result<RunRecord> {
        self.set_gate(run_id, false).await
    }

    async fn set_gate(&self, run_id: &str, paused: bool) -> Result<RunRecord> {
        let (next, event) = if paused {
            (RunStatus::Paused, RunEventKind::RunPaused {})
        } else {
            (RunStatus::Running, RunEventKind::RunResumed {})
        };
        let record = {
            let mut runs = self.active_runs.write().await;
            match runs.get_mut(run_id) {
                Some(active) => {
                    active.record.transition(next)?;
                    active.pause.send_replace(paused);
                    Some(active.record.clone())
                }
                None => None,
            }
        };
        let Some(record) = record else {
            return match self.get_run(run_id).await? {
                Some(run) => Err(RunFault::Validation(format!(
                    "run '{run_id}' is {} and cannot be {}",
                    run.status,
                    if paused { "paused" } else { "resumed" }
                ))),
                None => Err(RunFault::NotFound(run_id.to_string())),
            };
        };
        self.events.append(run_id, event);
        self.save(&record).await?;
        tracing::info!(status = %record.status, "Run gate changed");
        Ok(record)
    }

    // ----- Inspection -------------------------------------------------------

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        if let Some(active) = self.active_runs.read().await.get(run_id) {
            return Ok(Some(active.record.clone()));
        }
        match &self.persistence {
            Some(store) => store
                .load_run(run_id)
                .await
                .map_err(|e| RunFault::persistence(&e)),
            None => Ok(None),
        }
    }

    /// Runs that have not reached a terminal state, oldest first.
    pub async fn active_runs(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self
            .active_runs
            .read()
            .await
            .values()
            .map(|a| a.record.clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }
}

// =============================================================================
// Stream handle
// =============================================================================

/// Events of one run, ending after its terminal event.
///
/// Dropping the stream before the terminal event cancels the run.
pub struct RunEventStream {
    run_id: String,
    inner: BoxStream<'static, RunEvent>,
    finished: bool,
    cancellation: CancellationRegistry,
}

impl RunEventStream {
    fn new(
        run_id: String,
        inner: BoxStream<'static, RunEvent>,
        cancellation: CancellationRegistry,
    ) -> Self {
        Self {
            run_id,
            inner,
            finished: false,
            cancellation,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Keep following the run without owning it: dropping the returned
    /// stream leaves the run going.
    pub fn detach(mut self) -> BoxStream<'static, RunEvent> {
        self.finished = true;
        std::mem::replace(&mut self.inner, futures::stream::empty().boxed())
    }
}

impl fmt::Debug for RunEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEventStream")
            .field("run_id", &self.run_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for RunEventStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        let polled = self.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(event)) if event.kind.is_terminal() => self.finished = true,
            Poll::Ready(None) => self.finished = true,
            _ => {}
        }
        polled
    }
}

impl Drop for RunEventStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let run_id = std::mem::take(&mut self.run_id);
        let registry = self.cancellation.clone();
        tracing::info!(run_id = %run_id, "Event stream dropped early; cancelling run");
        runtime.spawn(async move {
            if let Err(e) = registry.cancel_run(&run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to cancel abandoned run");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uar::domain::steps::StepOutput;
    use crate::uar::persistence::migrations::{AppliedMigration, MigrationRegistry};
    use crate::uar::persistence::providers::memory::MemoryRunStore;
    use async_trait::async_trait;

    /// Yields before every call so concurrent dispatches interleave.
    #[derive(Debug, Default)]
    struct YieldingStore(MemoryRunStore);

    #[async_trait]
    impl RunStore for YieldingStore {
        async fn read_or_create_session(&self, fresh: SessionRecord) -> anyhow::Result<SessionRecord> {
            tokio::task::yield_now().await;
            self.0.read_or_create_session(fresh).await
        }

        async fn save_session(&self, session: &SessionRecord) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.0.save_session(session).await
        }

        async fn save_run(&self, run: &RunRecord) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.0.save_run(run).await
        }

        async fn load_run(&self, run_id: &str) -> anyhow::Result<Option<RunRecord>> {
            tokio::task::yield_now().await;
            self.0.load_run(run_id).await
        }

        async fn list_session_runs(&self, session_id: &str, limit: usize) -> anyhow::Result<Vec<RunRecord>> {
            tokio::task::yield_now().await;
            self.0.list_session_runs(session_id, limit).await
        }

        async fn apply_migrations(&self, registry: &MigrationRegistry) -> anyhow::Result<Vec<AppliedMigration>> {
            self.0.apply_migrations(registry).await
        }
    }

    fn manager() -> RunManager {
        let manager = RunManager::new(
            CancellationRegistry::in_memory(),
            Some(Arc::new(MemoryRunStore::new())),
            RuntimeSettings::default(),
        );
        manager.register_workflow(Workflow::new(
            "greet",
            vec![Step::function("hello", |input: StepInput| async move {
                Ok(StepOutput::new(format!("hello {}", input.input)))
            })],
        ));
        manager
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(DispatchMode::from_flags(false, false).unwrap(), DispatchMode::Sync);
        assert_eq!(DispatchMode::from_flags(true, false).unwrap(), DispatchMode::Stream);
        assert!(matches!(
            DispatchMode::from_flags(true, true),
            Err(RunFault::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_dispatch_returns_terminal_record() {
        let manager = manager();
        let request = DispatchRequest::new(OwnerType::Workflow, "greet", "world").run_id("r1");
        let Dispatched::Completed(record) = manager.dispatch(request).await.unwrap() else {
            panic!("expected a completed record");
        };
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.content.as_deref(), Some("hello world"));
        assert_eq!(manager.get_run("r1").await.unwrap(), Some(record));
        assert!(manager.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_owner_is_rejected_before_anything_runs() {
        let manager = manager();
        let request = DispatchRequest::new(OwnerType::Agent, "ghost", "hi").run_id("r1");
        assert!(matches!(
            manager.dispatch(request).await,
            Err(RunFault::Validation(_))
        ));
        assert_eq!(manager.get_run("r1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_background_requires_store() {
        let manager = RunManager::new(
            CancellationRegistry::in_memory(),
            None,
            RuntimeSettings::default(),
        );
        let request =
            DispatchRequest::new(OwnerType::Workflow, "greet", "hi").mode(DispatchMode::Background);
        assert!(matches!(
            manager.dispatch(request).await,
            Err(RunFault::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_run_ids_are_unique() {
        let manager = manager();
        let first = DispatchRequest::new(OwnerType::Workflow, "greet", "a").run_id("dup");
        manager.dispatch(first).await.unwrap();
        let second = DispatchRequest::new(OwnerType::Workflow, "greet", "b").run_id("dup");
        assert!(matches!(
            manager.dispatch(second).await,
            Err(RunFault::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_terminal_is_noop() {
        let manager = manager();
        let request = DispatchRequest::new(OwnerType::Workflow, "greet", "a").run_id("done");
        manager.dispatch(request).await.unwrap();
        assert!(!manager.cancel("done").await.unwrap());
        let record = manager.get_run("done").await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_claims_run_id_once() {
        let manager = RunManager::new(
            CancellationRegistry::in_memory(),
            Some(Arc::new(YieldingStore::default())),
            RuntimeSettings::default(),
        );
        manager.register_workflow(Workflow::new(
            "greet",
            vec![Step::function("hello", |input: StepInput| async move {
                Ok(StepOutput::new(input.input))
            })],
        ));

        let first = DispatchRequest::new(OwnerType::Workflow, "greet", "a").run_id("dup");
        let second = DispatchRequest::new(OwnerType::Workflow, "greet", "b").run_id("dup");
        let (a, b) = tokio::join!(manager.dispatch(first), manager.dispatch(second));

        let (won, lost) = match (a, b) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            (a, b) => panic!("expected exactly one dispatch to win: {a:?} / {b:?}"),
        };
        assert!(matches!(lost, RunFault::Validation(_)));
        let Dispatched::Completed(record) = won else {
            panic!("expected a completed record");
        };
        assert_eq!(record.status, RunStatus::Completed);

        let started = manager
            .events()
            .snapshot("dup")
            .unwrap()
            .events
            .iter()
            .filter(|e| e.kind.event_type() == "run_started")
            .count();
        assert_eq!(started, 1);
        assert!(manager.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_dispatch_releases_its_claim() {
        let manager = manager();
        let store = manager.persistence.clone().unwrap();
        let mut old = RunRecord::new("kept", OwnerType::Workflow, "greet", "x");
        old.transition(RunStatus::Cancelled).unwrap();
        store.save_run(&old).await.unwrap();

        let request = DispatchRequest::new(OwnerType::Workflow, "greet", "y").run_id("kept");
        assert!(matches!(
            manager.dispatch(request).await,
            Err(RunFault::Validation(_))
        ));
        assert!(manager.active_runs().await.is_empty());
        assert_eq!(manager.get_run("kept").await.unwrap().unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_event_logs_are_evicted_after_retention() {
        let manager = RunManager::new(
            CancellationRegistry::in_memory(),
            Some(Arc::new(MemoryRunStore::new())),
            RuntimeSettings {
                event_retention: Some(Duration::from_secs(60)),
                ..RuntimeSettings::default()
            },
        );
        manager.register_workflow(Workflow::new(
            "greet",
            vec![Step::function("hello", |input: StepInput| async move {
                Ok(StepOutput::new(input.input))
            })],
        ));
        let request = DispatchRequest::new(OwnerType::Workflow, "greet", "a").run_id("old");
        manager.dispatch(request).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(manager.events().contains("old"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(!manager.events().contains("old"));
        // The durable record outlives the log and still guards the id.
        assert!(manager.get_run("old").await.unwrap().is_some());
        let again = DispatchRequest::new(OwnerType::Workflow, "greet", "b").run_id("old");
        assert!(manager.dispatch(again).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_racing_completion_leaves_no_flag_behind() {
        let manager = manager();
        for i in 0..20 {
            let run_id = format!("race-{i}");
            let runner = manager.clone();
            let canceller = manager.clone();
            let (id_a, id_b) = (run_id.clone(), run_id.clone());
            let run = tokio::spawn(async move {
                runner
                    .dispatch(DispatchRequest::new(OwnerType::Workflow, "greet", "x").run_id(id_a))
                    .await
            });
            let cancel = tokio::spawn(async move { canceller.cancel(&id_b).await });
            run.await.unwrap().unwrap();
            cancel.await.unwrap().unwrap();

            let flags = manager.cancellation().get_active_runs().await.unwrap();
            assert!(!flags.contains_key(&run_id), "{run_id}");
        }
    }
}
