use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::StepContext;
use crate::uar::domain::steps::{StepInput, StepOutput, StepType};
use crate::uar::runtime::expression::CompiledExpression;

// =============================================================================
// Bodies
// =============================================================================

/// The body of a primitive step.
#[async_trait]
pub trait StepExecutor: Send + Sync + fmt::Debug {
    async fn execute(&self, input: StepInput, ctx: &StepContext) -> anyhow::Result<StepOutput>;
}

/// An agent or team: takes the step input, produces content.
///
/// Implementations may stream through `ctx.emit_delta` and call tools through
/// `ctx.call_tool`; long bodies should call `ctx.checkpoint()` between calls.
#[async_trait]
pub trait Invocable: Send + Sync + fmt::Debug {
    async fn invoke(&self, input: StepInput, ctx: &StepContext) -> anyhow::Result<String>;
}

/// Runs an [`Invocable`] as a step, checkpointing around the call.
#[derive(Debug, Clone)]
pub struct InvocableStep(pub Arc<dyn Invocable>);

#[async_trait]
impl StepExecutor for InvocableStep {
    async fn execute(&self, input: StepInput, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        ctx.checkpoint().await?;
        let content = self.0.invoke(input, ctx).await?;
        ctx.checkpoint().await?;
        Ok(StepOutput::new(content))
    }
}

/// Adapter for plain async functions.
pub struct FnStep<F>(F);

impl<F> fmt::Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnStep")
    }
}

#[async_trait]
impl<F, Fut> StepExecutor for FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StepOutput>> + Send,
{
    async fn execute(&self, input: StepInput, _ctx: &StepContext) -> anyhow::Result<StepOutput> {
        (self.0)(input).await
    }
}

/// Wrap an async function as a step body.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn StepExecutor>
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StepOutput>> + Send + 'static,
{
    Arc::new(FnStep(f))
}

// =============================================================================
// Decisions
// =============================================================================

/// What a failing primitive does to its enclosing composite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
}

type PredicateFn = dyn Fn(&StepInput) -> bool + Send + Sync;
type SelectorFn = dyn Fn(&StepInput) -> Option<String> + Send + Sync;
type EndConditionFn = dyn Fn(&[StepOutput]) -> bool + Send + Sync;

#[derive(Clone)]
pub enum Predicate {
    Expression(CompiledExpression),
    Function(Arc<PredicateFn>),
}

impl Predicate {
    pub fn function(f: impl Fn(&StepInput) -> bool + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }
}

#[derive(Clone)]
pub enum Selector {
    Expression(CompiledExpression),
    Function(Arc<SelectorFn>),
}

impl Selector {
    pub fn function(f: impl Fn(&StepInput) -> Option<String> + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }
}

/// Exit test run after every loop iteration.
#[derive(Clone)]
pub enum EndCondition {
    /// Sees `current_iteration`, `max_iterations` and `iteration_outputs`.
    Expression(CompiledExpression),
    /// Receives the outputs of every finished iteration.
    Function(Arc<EndConditionFn>),
}

impl EndCondition {
    pub fn function(f: impl Fn(&[StepOutput]) -> bool + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }
}

macro_rules! debug_by_source {
    ($($ty:ident),*) => {$(
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    Self::Expression(expr) => write!(f, "{}({:?})", stringify!($ty), expr.source()),
                    Self::Function(_) => write!(f, "{}(<fn>)", stringify!($ty)),
                }
            }
        }
    )*};
}

debug_by_source!(Predicate, Selector, EndCondition);

// =============================================================================
// Step graph
// =============================================================================

#[derive(Debug, Clone)]
pub struct PrimitiveStep {
    pub name: String,
    pub step_type: StepType,
    pub body: Arc<dyn StepExecutor>,
    pub add_history: bool,
    pub num_history_runs: usize,
    pub on_error: OnError,
}

impl PrimitiveStep {
    pub fn new(name: impl Into<String>, body: Arc<dyn StepExecutor>) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::Step,
            body,
            add_history: false,
            num_history_runs: 3,
            on_error: OnError::Fail,
        }
    }

    #[must_use]
    pub fn with_type(mut self, step_type: StepType) -> Self {
        self.step_type = step_type;
        self
    }

    /// Hand the last `runs` runs of the session to this step.
    #[must_use]
    pub fn with_history(mut self, runs: usize) -> Self {
        self.add_history = true;
        self.num_history_runs = runs;
        self
    }

    #[must_use]
    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LoopStep {
    pub name: String,
    pub steps: Vec<Step>,
    pub max_iterations: u32,
    pub end_condition: Option<EndCondition>,
}

#[derive(Debug, Clone)]
pub struct RouterStep {
    pub name: String,
    pub selector: Selector,
    pub routes: Vec<(String, Step)>,
    pub default: Option<Box<Step>>,
}

#[derive(Debug, Clone)]
pub struct ConditionStep {
    pub name: String,
    pub predicate: Predicate,
    pub steps: Vec<Step>,
    pub else_steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub enum Step {
    Primitive(PrimitiveStep),
    Sequence { name: String, steps: Vec<Step> },
    Loop(LoopStep),
    Router(RouterStep),
    Condition(ConditionStep),
}

impl From<PrimitiveStep> for Step {
    fn from(step: PrimitiveStep) -> Self {
        Self::Primitive(step)
    }
}

impl Step {
    pub fn executor(name: impl Into<String>, body: Arc<dyn StepExecutor>) -> Self {
        PrimitiveStep::new(name, body).into()
    }

    pub fn function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepOutput>> + Send + 'static,
    {
        Self::executor(name, from_fn(f))
    }

    pub fn agent(name: impl Into<String>, agent: Arc<dyn Invocable>) -> Self {
        PrimitiveStep::new(name, Arc::new(InvocableStep(agent)))
            .with_type(StepType::Agent)
            .into()
    }

    pub fn team(name: impl Into<String>, team: Arc<dyn Invocable>) -> Self {
        PrimitiveStep::new(name, Arc::new(InvocableStep(team)))
            .with_type(StepType::Team)
            .into()
    }

    pub fn sequence(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::Sequence {
            name: name.into(),
            steps,
        }
    }

    pub fn looped(
        name: impl Into<String>,
        steps: Vec<Step>,
        max_iterations: u32,
        end_condition: Option<EndCondition>,
    ) -> Self {
        Self::Loop(LoopStep {
            name: name.into(),
            steps,
            max_iterations,
            end_condition,
        })
    }

    pub fn condition(
        name: impl Into<String>,
        predicate: Predicate,
        steps: Vec<Step>,
        else_steps: Vec<Step>,
    ) -> Self {
        Self::Condition(ConditionStep {
            name: name.into(),
            predicate,
            steps,
            else_steps,
        })
    }

    pub fn router(
        name: impl Into<String>,
        selector: Selector,
        routes: Vec<(String, Step)>,
        default: Option<Step>,
    ) -> Self {
        Self::Router(RouterStep {
            name: name.into(),
            selector,
            routes,
            default: default.map(Box::new),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Primitive(step) => &step.name,
            Self::Sequence { name, .. } => name,
            Self::Loop(step) => &step.name,
            Self::Router(step) => &step.name,
            Self::Condition(step) => &step.name,
        }
    }

    pub fn step_type(&self) -> StepType {
        match self {
            Self::Primitive(step) => step.step_type,
            Self::Sequence { .. } => StepType::Sequence,
            Self::Loop(_) => StepType::Loop,
            Self::Router(_) => StepType::Router,
            Self::Condition(_) => StepType::Condition,
        }
    }

    /// Largest history window any primitive below this step asks for.
    fn history_depth(&self) -> usize {
        let nested = |steps: &[Step]| steps.iter().map(Step::history_depth).max().unwrap_or(0);
        match self {
            Self::Primitive(step) if step.add_history => step.num_history_runs,
            Self::Primitive(_) => 0,
            Self::Sequence { steps, .. } | Self::Loop(LoopStep { steps, .. }) => nested(steps),
            Self::Condition(step) => nested(&step.steps).max(nested(&step.else_steps)),
            Self::Router(step) => step
                .routes
                .iter()
                .map(|(_, route)| route.history_depth())
                .chain(step.default.iter().map(|d| d.history_depth()))
                .max()
                .unwrap_or(0),
        }
    }
}

/// A named, ready-to-run step graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// How many earlier session runs must be loaded before executing.
    pub fn history_depth(&self) -> usize {
        self.steps.iter().map(Step::history_depth).max().unwrap_or(0)
    }
}
