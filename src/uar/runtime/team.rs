//! Autonomous teams working through a dependency-ordered task board.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::uar::domain::events::RunEventKind;
use crate::uar::domain::steps::{StepInput, StepOutput, StepType};
use crate::uar::domain::tasks::{Task, TaskList, TaskListError, TaskStatus};
use crate::uar::runtime::engine::{Interrupt, Invocable, StepContext, StepExecutor};

/// Runs a [`TaskList`] by handing ready tasks to team members.
///
/// Tasks whose dependencies are met run concurrently, one round at a time,
/// with a checkpoint before each round. A failed task fails its dependents;
/// tasks left blocked (unknown dependencies) make the step fail.
#[derive(Debug, Clone)]
pub struct TaskBoardStep {
    tasks: Vec<Task>,
    members: HashMap<String, Arc<dyn Invocable>>,
}

impl TaskBoardStep {
    pub fn new(tasks: Vec<Task>) -> Result<Self, TaskListError> {
        // Validates ids up front.
        TaskList::from_tasks(tasks.clone())?;
        Ok(Self {
            tasks,
            members: HashMap::new(),
        })
    }

    #[must_use]
    pub fn member(mut self, name: impl Into<String>, member: Arc<dyn Invocable>) -> Self {
        self.members.insert(name.into(), member);
        self
    }

    fn task_input(base: &StepInput, task: &Task, board: &TaskList) -> StepInput {
        let mut input = base.clone();
        input.input = if task.description.is_empty() {
            task.title.clone()
        } else {
            format!("{}\n\n{}", task.title, task.description)
        };
        for done in board.tasks().iter().filter(|t| t.status == TaskStatus::Completed) {
            if let Some(result) = &done.result {
                input.previous_step_outputs.insert(done.id.clone(), result.clone());
            }
        }
        input.previous_step_content = task
            .dependencies
            .iter()
            .filter_map(|dep| board.get(dep).and_then(|t| t.result.clone()))
            .reduce(|acc, next| format!("{acc}\n\n{next}"));
        input
    }
}

#[async_trait]
impl StepExecutor for TaskBoardStep {
    async fn execute(&self, input: StepInput, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        let mut board = TaskList::from_tasks(self.tasks.clone())?;
        let mut children = Vec::new();

        while !board.is_settled() {
            ctx.checkpoint().await?;

            let ready: Vec<Task> = board.ready().into_iter().cloned().collect();
            if ready.is_empty() {
                break;
            }

            let mut round = Vec::with_capacity(ready.len());
            for task in &ready {
                board.start(&task.id)?;
                ctx.emit(RunEventKind::StepStarted {
                    step_name: task.id.clone(),
                    step_type: StepType::Task,
                });
                let member = task
                    .assignee
                    .as_deref()
                    .and_then(|name| self.members.get(name))
                    .cloned();
                let task_input = Self::task_input(&input, task, &board);
                let task_ctx = ctx.child(task.id.clone());
                round.push(async move {
                    let result = match member {
                        Some(member) => member.invoke(task_input, &task_ctx).await,
                        None => Err(anyhow::anyhow!(
                            "no team member named {:?}",
                            task.assignee.as_deref().unwrap_or("<unassigned>")
                        )),
                    };
                    (task, result)
                });
            }

            for (task, result) in join_all(round).await {
                let output = match result {
                    Ok(content) => {
                        board.complete(&task.id, content.clone())?;
                        StepOutput::new(content)
                    }
                    Err(err) => {
                        if let Some(interrupt) = err.downcast_ref::<Interrupt>() {
                            return Err(interrupt.clone().into());
                        }
                        let message = format!("{err:#}");
                        tracing::warn!(task = %task.id, error = %message, "Team task failed");
                        board.fail(&task.id, message.clone())?;
                        StepOutput::failed(task.id.clone(), message)
                    }
                };
                let output = StepOutput {
                    step_name: task.id.clone(),
                    step_type: StepType::Task,
                    ..output
                };
                ctx.emit(RunEventKind::StepCompleted {
                    step_name: output.step_name.clone(),
                    step_type: StepType::Task,
                    success: output.success,
                    stop: false,
                });
                children.push(output);
            }
        }

        let failed = board.count(TaskStatus::Failed);
        let blocked = board.count(TaskStatus::Blocked);
        let content = board
            .tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.result.as_ref().map(|r| format!("## {}\n{r}", t.title)))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut output = StepOutput::new(content);
        output.children = children;
        if failed + blocked > 0 {
            output.success = false;
            output.error = Some(format!(
                "{failed} task(s) failed and {blocked} remained blocked"
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uar::runtime::cancellation::CancellationRegistry;
    use crate::uar::runtime::engine::RunScope;
    use crate::uar::runtime::event_log::RunEventLog;

    #[derive(Debug)]
    struct Writer(&'static str);

    #[async_trait]
    impl Invocable for Writer {
        async fn invoke(&self, input: StepInput, _ctx: &StepContext) -> anyhow::Result<String> {
            if input.input.contains("explode") {
                anyhow::bail!("{} refused", self.0);
            }
            let upstream = input.previous_step_content.unwrap_or_default();
            Ok(format!("{}: {}{}", self.0, input.input, upstream.len()))
        }
    }

    fn ctx(events: &RunEventLog) -> StepContext {
        let scope = RunScope::new("r1", events.clone(), CancellationRegistry::in_memory());
        StepContext::new(Arc::new(scope), "board")
    }

    #[tokio::test]
    async fn test_board_runs_tasks_in_dependency_order() {
        let events = RunEventLog::new();
        let board = TaskBoardStep::new(vec![
            Task::new("research", "Research").assigned_to("researcher"),
            Task::new("draft", "Draft")
                .assigned_to("writer")
                .depends_on("research"),
        ])
        .unwrap()
        .member("researcher", Arc::new(Writer("researcher")))
        .member("writer", Arc::new(Writer("writer")));

        let output = board.execute(StepInput::new("topic"), &ctx(&events)).await.unwrap();
        assert!(output.success);
        let order: Vec<&str> = output.children.iter().map(|c| c.step_name.as_str()).collect();
        assert_eq!(order, vec!["research", "draft"]);
        assert!(output.content.unwrap().contains("## Draft"));
    }

    #[tokio::test]
    async fn test_failure_propagates_to_dependents() {
        let events = RunEventLog::new();
        let board = TaskBoardStep::new(vec![
            Task::new("a", "explode").assigned_to("w"),
            Task::new("b", "after").assigned_to("w").depends_on("a"),
            Task::new("c", "independent").assigned_to("w"),
        ])
        .unwrap()
        .member("w", Arc::new(Writer("w")));

        let output = board.execute(StepInput::new("x"), &ctx(&events)).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.error.as_deref(), Some("2 task(s) failed and 0 remained blocked"));
        // `b` never ran: only `a` and `c` produced outputs.
        assert_eq!(output.children.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_dependency_blocks() {
        let events = RunEventLog::new();
        let board = TaskBoardStep::new(vec![Task::new("a", "orphan").assigned_to("w").depends_on("ghost")])
            .unwrap()
            .member("w", Arc::new(Writer("w")));
        let output = board.execute(StepInput::new("x"), &ctx(&events)).await.unwrap();
        assert!(!output.success);
        assert!(output.children.is_empty());
    }
}
