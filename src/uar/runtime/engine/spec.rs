//! Declarative workflow definitions (YAML or JSON) and their compilation.
//!
//! Compilation resolves every named body against an [`ExecutorRegistry`] and
//! compiles every expression, so a broken definition is rejected before any
//! step of any run executes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};

use super::registry::ExecutorRegistry;
use super::step::{
    EndCondition, InvocableStep, OnError, Predicate, PrimitiveStep, Selector, Step, Workflow,
};
use crate::error::RunFault;
use crate::uar::domain::steps::StepType;
use crate::uar::domain::tasks::Task;
use crate::uar::runtime::expression::ExpressionEngine;
use crate::uar::runtime::team::TaskBoardStep;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
}

fn default_history_runs() -> usize {
    3
}

fn default_max_iterations() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    /// Exactly one of `executor`, `agent` or `team` names the body.
    Step {
        name: String,
        #[serde(default)]
        executor: Option<String>,
        #[serde(default)]
        agent: Option<String>,
        #[serde(default)]
        team: Option<String>,
        #[serde(default)]
        add_history: bool,
        #[serde(default = "default_history_runs")]
        num_history_runs: usize,
        #[serde(default)]
        on_error: OnError,
    },
    Sequence {
        name: String,
        steps: Vec<StepSpec>,
    },
    Loop {
        name: String,
        steps: Vec<StepSpec>,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        #[serde(default)]
        end_condition: Option<String>,
    },
    Router {
        name: String,
        selector: String,
        routes: BTreeMap<String, StepSpec>,
        #[serde(default)]
        default: Option<Box<StepSpec>>,
    },
    Condition {
        name: String,
        condition: String,
        steps: Vec<StepSpec>,
        #[serde(default)]
        else_steps: Vec<StepSpec>,
    },
    /// A team working through `tasks`; `members` maps each assignee to a
    /// registered agent or team.
    TaskBoard {
        name: String,
        tasks: Vec<Task>,
        members: BTreeMap<String, String>,
        #[serde(default)]
        on_error: OnError,
    },
}

impl WorkflowSpec {
    pub fn from_yaml(source: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json(source: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Read every `*.yaml`, `*.yml` and `*.json` definition in `dir`.
    ///
    /// A missing directory yields nothing; unreadable files are logged and skipped.
    pub async fn load_dir(dir: &Path) -> anyhow::Result<Vec<Self>> {
        if !dir.exists() {
            warn!(dir = ?dir, "Workflow directory not found");
            return Ok(Vec::new());
        }

        let mut specs = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            let parsed = if ext == "json" {
                Self::from_json(&content)
            } else {
                Self::from_yaml(&content)
            };
            match parsed {
                Ok(spec) => {
                    info!(workflow = %spec.name, path = ?path, "Loaded workflow definition");
                    specs.push(spec);
                }
                Err(e) => error!(path = ?path, error = %e, "Failed to parse workflow definition"),
            }
        }
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }

    pub fn compile(
        &self,
        registry: &ExecutorRegistry,
        expressions: &ExpressionEngine,
    ) -> Result<Workflow, RunFault> {
        if self.steps.is_empty() {
            return Err(RunFault::Validation(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }
        let compiler = Compiler {
            registry,
            expressions,
        };
        let steps = compiler.steps(&self.steps)?;
        let mut workflow = Workflow::new(self.name.clone(), steps);
        workflow.description.clone_from(&self.description);
        Ok(workflow)
    }
}

struct Compiler<'a> {
    registry: &'a ExecutorRegistry,
    expressions: &'a ExpressionEngine,
}

impl Compiler<'_> {
    fn steps(&self, specs: &[StepSpec]) -> Result<Vec<Step>, RunFault> {
        specs.iter().map(|spec| self.step(spec)).collect()
    }

    fn step(&self, spec: &StepSpec) -> Result<Step, RunFault> {
        match spec {
            StepSpec::Step {
                name,
                executor,
                agent,
                team,
                add_history,
                num_history_runs,
                on_error,
            } => {
                let mut primitive = match (executor, agent, team) {
                    (Some(id), None, None) => {
                        let body = self
                            .registry
                            .executor(id)
                            .ok_or_else(|| unknown(name, "executor", id))?;
                        PrimitiveStep::new(name.clone(), body)
                    }
                    (None, Some(id), None) => {
                        let agent = self
                            .registry
                            .agent(id)
                            .ok_or_else(|| unknown(name, "agent", id))?;
                        PrimitiveStep::new(name.clone(), Arc::new(InvocableStep(agent)))
                            .with_type(StepType::Agent)
                    }
                    (None, None, Some(id)) => {
                        let team = self
                            .registry
                            .team(id)
                            .ok_or_else(|| unknown(name, "team", id))?;
                        PrimitiveStep::new(name.clone(), Arc::new(InvocableStep(team)))
                            .with_type(StepType::Team)
                    }
                    _ => {
                        return Err(RunFault::Validation(format!(
                            "step '{name}' must name exactly one of executor, agent or team"
                        )));
                    }
                };
                primitive.add_history = *add_history;
                primitive.num_history_runs = *num_history_runs;
                primitive.on_error = *on_error;
                Ok(primitive.into())
            }
            StepSpec::Sequence { name, steps } => Ok(Step::sequence(name.clone(), self.steps(steps)?)),
            StepSpec::Loop {
                name,
                steps,
                max_iterations,
                end_condition,
            } => {
                if *max_iterations == 0 {
                    return Err(RunFault::Validation(format!(
                        "loop '{name}' needs max_iterations of at least 1"
                    )));
                }
                let end_condition = end_condition
                    .as_deref()
                    .map(|source| self.expressions.compile(source).map(EndCondition::Expression))
                    .transpose()?;
                Ok(Step::looped(
                    name.clone(),
                    self.steps(steps)?,
                    *max_iterations,
                    end_condition,
                ))
            }
            StepSpec::Router {
                name,
                selector,
                routes,
                default,
            } => {
                let selector = Selector::Expression(self.expressions.compile(selector)?);
                let routes = routes
                    .iter()
                    .map(|(route, spec)| Ok((route.clone(), self.step(spec)?)))
                    .collect::<Result<Vec<_>, RunFault>>()?;
                let default = default.as_deref().map(|spec| self.step(spec)).transpose()?;
                Ok(Step::router(name.clone(), selector, routes, default))
            }
            StepSpec::Condition {
                name,
                condition,
                steps,
                else_steps,
            } => {
                let predicate = Predicate::Expression(self.expressions.compile(condition)?);
                Ok(Step::condition(
                    name.clone(),
                    predicate,
                    self.steps(steps)?,
                    self.steps(else_steps)?,
                ))
            }
            StepSpec::TaskBoard {
                name,
                tasks,
                members,
                on_error,
            } => {
                let mut board = TaskBoardStep::new(tasks.clone())
                    .map_err(|e| RunFault::Validation(format!("task board '{name}': {e}")))?;
                for (assignee, id) in members {
                    let member = self
                        .registry
                        .agent(id)
                        .or_else(|| self.registry.team(id))
                        .ok_or_else(|| unknown(name, "agent or team", id))?;
                    board = board.member(assignee.clone(), member);
                }
                Ok(PrimitiveStep::new(name.clone(), Arc::new(board))
                    .with_type(StepType::Team)
                    .on_error(*on_error)
                    .into())
            }
        }
    }
}

fn unknown(step: &str, kind: &str, id: &str) -> RunFault {
    RunFault::Validation(format!("step '{step}' references unknown {kind} '{id}'"))
}
