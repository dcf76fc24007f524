//! Interpreter for workflow step graphs.
//!
//! One exhaustive match over [`Step`] drives every composite. Each step pushes
//! exactly one [`StepOutput`] into its parent's list, complete or partial, and
//! reports whether execution may continue ([`Flow`]) or why it was cut short
//! ([`Interrupt`]). Cancellation and timeouts are observed at child boundaries
//! and wherever a body calls [`StepContext::checkpoint`].

mod context;
mod registry;
mod spec;
mod step;

pub use context::{Interrupt, RunScope, StepContext, Tool};
pub use registry::ExecutorRegistry;
pub use spec::{StepSpec, WorkflowSpec};
pub use step::{
    ConditionStep, EndCondition, FnStep, Invocable, InvocableStep, LoopStep, OnError, Predicate,
    PrimitiveStep, RouterStep, Selector, Step, StepExecutor, Workflow, from_fn,
};

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::ExpressionError;
use crate::uar::domain::events::RunEventKind;
use crate::uar::domain::steps::{StepInput, StepOutput, StepType};
use crate::uar::runtime::expression::ExpressionContext;

/// Whether the enclosing composite may schedule its next child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Everything a workflow produced, including partial work on interruption.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub outputs: Vec<StepOutput>,
    pub content: Option<String>,
    /// A step requested early termination.
    pub stopped: bool,
    pub interrupt: Option<Interrupt>,
}

/// Stateless interpreter; one instance serves every run.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepEngine;

struct RunState {
    input: StepInput,
    scope: Arc<RunScope>,
}

impl RunState {
    /// Thread a finished step's content into what later steps see.
    fn record(&mut self, output: &StepOutput) {
        if let Some(content) = &output.content {
            self.input.previous_step_content = Some(content.clone());
            self.input
                .previous_step_outputs
                .insert(output.step_name.clone(), content.clone());
        }
    }
}

fn last_content(outputs: &[StepOutput]) -> Option<String> {
    outputs.iter().rev().find_map(|o| o.content.clone())
}

/// Content of a finished list of outputs. After a stop, the stopping output is
/// always the last one and its content wins, even when it has none.
fn settled_content(outputs: &[StepOutput], result: &Result<Flow, Interrupt>) -> Option<String> {
    match result {
        Ok(Flow::Stop) => outputs.last().and_then(|o| o.content.clone()),
        _ => last_content(outputs),
    }
}

fn composite(
    name: &str,
    step_type: StepType,
    children: Vec<StepOutput>,
    result: &Result<Flow, Interrupt>,
) -> StepOutput {
    let mut output = StepOutput {
        step_name: name.to_string(),
        step_type,
        content: settled_content(&children, result),
        success: result.is_ok() && children.iter().all(|c| c.success),
        stop: matches!(result, Ok(Flow::Stop)),
        error: None,
        children,
    };
    if let Err(interrupt) = result {
        output.error = Some(interrupt.to_string());
    }
    output
}

impl StepEngine {
    pub fn new() -> Self {
        Self
    }

    /// Execute `workflow` to the end, an early stop, or an interruption.
    pub async fn run(
        &self,
        workflow: &Workflow,
        input: StepInput,
        scope: Arc<RunScope>,
    ) -> WorkflowOutcome {
        let mut state = RunState { input, scope };
        let mut outputs = Vec::new();
        let result = self.run_steps(&workflow.steps, &mut state, &mut outputs).await;

        let content = settled_content(&outputs, &result);
        match result {
            Ok(flow) => WorkflowOutcome {
                outputs,
                content,
                stopped: flow == Flow::Stop,
                interrupt: None,
            },
            Err(interrupt) => WorkflowOutcome {
                outputs,
                content,
                stopped: false,
                interrupt: Some(interrupt),
            },
        }
    }

    fn run_steps<'a>(
        &'a self,
        steps: &'a [Step],
        state: &'a mut RunState,
        out: &'a mut Vec<StepOutput>,
    ) -> BoxFuture<'a, Result<Flow, Interrupt>> {
        Box::pin(async move {
            for step in steps {
                state.scope.checkpoint().await?;
                if self.run_step(step, state, out).await? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
            }
            Ok(Flow::Continue)
        })
    }

    fn run_step<'a>(
        &'a self,
        step: &'a Step,
        state: &'a mut RunState,
        out: &'a mut Vec<StepOutput>,
    ) -> BoxFuture<'a, Result<Flow, Interrupt>> {
        Box::pin(async move {
            state.scope.emit(RunEventKind::StepStarted {
                step_name: step.name().to_string(),
                step_type: step.step_type(),
            });

            let (output, result) = match step {
                Step::Primitive(primitive) => self.run_primitive(primitive, state).await,
                Step::Sequence { name, steps } => {
                    let mut children = Vec::new();
                    let result = self.run_steps(steps, state, &mut children).await;
                    (composite(name, StepType::Sequence, children, &result), result)
                }
                Step::Loop(looped) => self.run_loop(looped, state).await,
                Step::Router(router) => self.run_router(router, state).await,
                Step::Condition(condition) => self.run_condition(condition, state).await,
            };

            if result.is_ok() {
                state.scope.emit(RunEventKind::StepCompleted {
                    step_name: output.step_name.clone(),
                    step_type: output.step_type,
                    success: output.success,
                    stop: output.stop,
                });
                state.record(&output);
            }
            out.push(output);
            result
        })
    }

    async fn run_primitive(
        &self,
        step: &PrimitiveStep,
        state: &mut RunState,
    ) -> (StepOutput, Result<Flow, Interrupt>) {
        let mut input = state.input.clone();
        if step.add_history {
            input.history = state.scope.recent_history(step.num_history_runs);
        }
        let ctx = StepContext::new(Arc::clone(&state.scope), step.name.clone());

        let mut output = match step.body.execute(input, &ctx).await {
            Ok(output) => output,
            Err(err) => match err.downcast::<Interrupt>() {
                Ok(interrupt) => {
                    let output = StepOutput::failed(&step.name, interrupt.to_string());
                    return (output, Err(interrupt));
                }
                Err(err) => StepOutput::failed(&step.name, format!("{err:#}")),
            },
        };
        output.step_name.clone_from(&step.name);
        output.step_type = step.step_type;

        if output.success {
            let flow = if output.stop { Flow::Stop } else { Flow::Continue };
            return (output, Ok(flow));
        }

        let message = output
            .error
            .clone()
            .unwrap_or_else(|| format!("step '{}' failed", step.name));
        match step.on_error {
            OnError::Fail => {
                tracing::error!(run_id = %state.scope.run_id, step = %step.name, error = %message, "Step failed");
                (output, Err(Interrupt::Failed(message)))
            }
            OnError::Continue => {
                tracing::warn!(run_id = %state.scope.run_id, step = %step.name, error = %message, "Step failed; continuing");
                let flow = if output.stop { Flow::Stop } else { Flow::Continue };
                (output, Ok(flow))
            }
        }
    }

    async fn run_loop(
        &self,
        step: &LoopStep,
        state: &mut RunState,
    ) -> (StepOutput, Result<Flow, Interrupt>) {
        let mut iterations: Vec<StepOutput> = Vec::new();
        let mut result = Ok(Flow::Continue);

        for iteration in 1..=step.max_iterations {
            let mut children = Vec::new();
            let pass = self.run_steps(&step.steps, state, &mut children).await;
            let name = format!("{}[{iteration}]", step.name);
            iterations.push(composite(&name, StepType::LoopIteration, children, &pass));

            match pass {
                Ok(Flow::Continue) => {}
                other => {
                    result = other;
                    break;
                }
            }

            let done = match &step.end_condition {
                None => false,
                Some(EndCondition::Function(f)) => f(&iterations),
                Some(EndCondition::Expression(expr)) => {
                    let ctx = ExpressionContext::from_input(&state.input).with_loop(
                        iteration,
                        step.max_iterations,
                        &iterations,
                    );
                    match expr.evaluate_bool(&ctx) {
                        Ok(done) => done,
                        Err(e) => {
                            result = Err(Interrupt::Expression(e));
                            break;
                        }
                    }
                }
            };
            if done {
                tracing::debug!(loop_step = %step.name, iteration, "Loop end condition met");
                break;
            }
        }

        (composite(&step.name, StepType::Loop, iterations, &result), result)
    }

    async fn run_router(
        &self,
        step: &RouterStep,
        state: &mut RunState,
    ) -> (StepOutput, Result<Flow, Interrupt>) {
        let selected = match &step.selector {
            Selector::Function(f) => Ok(f(&state.input)),
            Selector::Expression(expr) => {
                expr.evaluate_selector(&ExpressionContext::from_input(&state.input))
            }
        };
        let selected = match selected {
            Ok(selected) => selected,
            Err(e) => {
                let result = Err(Interrupt::Expression(e));
                return (composite(&step.name, StepType::Router, Vec::new(), &result), result);
            }
        };

        let matched = selected
            .as_deref()
            .and_then(|name| step.routes.iter().find(|(route, _)| route == name))
            .map(|(_, route)| route);
        let route = match (matched, &step.default) {
            (Some(route), _) => route,
            (None, Some(default)) => {
                tracing::warn!(router = %step.name, selected = ?selected, "No matching route; using default");
                &**default
            }
            (None, None) => {
                let result = Err(Interrupt::Expression(ExpressionError::UnknownRoute {
                    router: step.name.clone(),
                    selected: selected.unwrap_or_default(),
                }));
                return (composite(&step.name, StepType::Router, Vec::new(), &result), result);
            }
        };

        let mut children = Vec::new();
        let result = self.run_step(route, state, &mut children).await;
        (composite(&step.name, StepType::Router, children, &result), result)
    }

    async fn run_condition(
        &self,
        step: &ConditionStep,
        state: &mut RunState,
    ) -> (StepOutput, Result<Flow, Interrupt>) {
        let passed = match &step.predicate {
            Predicate::Function(f) => Ok(f(&state.input)),
            Predicate::Expression(expr) => {
                expr.evaluate_bool(&ExpressionContext::from_input(&state.input))
            }
        };
        let branch = match passed {
            Ok(true) => &step.steps,
            Ok(false) => &step.else_steps,
            Err(e) => {
                let result = Err(Interrupt::Expression(e));
                return (composite(&step.name, StepType::Condition, Vec::new(), &result), result);
            }
        };

        let mut children = Vec::new();
        let result = self.run_steps(branch, state, &mut children).await;
        (composite(&step.name, StepType::Condition, children, &result), result)
    }
}
