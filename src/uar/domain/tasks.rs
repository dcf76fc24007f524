//! Task lists for autonomous teams.
//!
//! Dependency handling is fail-closed: a task stays `blocked` while any
//! dependency is unfinished or unknown, and becomes `failed` as soon as a
//! dependency fails, so a broken dependency can never deadlock the board.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub assignee: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub result: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            assignee: None,
            dependencies: Vec::new(),
            result: None,
        }
    }

    #[must_use]
    pub fn assigned_to(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskListError {
    #[error("task '{0}' already exists")]
    Duplicate(String),
    #[error("task '{0}' not found")]
    Unknown(String),
    #[error("task '{id}' is {status:?} and cannot be started")]
    NotReady { id: String, status: TaskStatus },
}

/// Ordered collection of tasks with dependency bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskList {
    tasks: Vec<Task>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, TaskListError> {
        let mut list = Self::new();
        for task in tasks {
            list.add(task)?;
        }
        Ok(list)
    }

    pub fn add(&mut self, task: Task) -> Result<(), TaskListError> {
        if self.get(&task.id).is_some() {
            return Err(TaskListError::Duplicate(task.id));
        }
        self.tasks.push(task);
        self.refresh();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Re-apply the dependency rules until nothing changes.
    ///
    /// Failure propagates transitively, so the loop runs at most once per task.
    pub fn refresh(&mut self) {
        loop {
            let statuses: HashMap<String, TaskStatus> = self
                .tasks
                .iter()
                .map(|t| (t.id.clone(), t.status))
                .collect();
            let mut changed = false;

            for task in &mut self.tasks {
                if matches!(
                    task.status,
                    TaskStatus::Completed | TaskStatus::Failed | TaskStatus::InProgress
                ) {
                    continue;
                }

                let failed_dependency = task
                    .dependencies
                    .iter()
                    .find(|dep| statuses.get(*dep) == Some(&TaskStatus::Failed));
                let next = if let Some(dep) = failed_dependency {
                    task.result = Some(format!("dependency '{dep}' failed"));
                    TaskStatus::Failed
                } else if task
                    .dependencies
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&TaskStatus::Completed))
                {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Blocked
                };

                if next != task.status {
                    task.status = next;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Tasks whose dependencies are all completed and that have not started.
    pub fn ready(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect()
    }

    pub fn start(&mut self, id: &str) -> Result<(), TaskListError> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Pending {
            return Err(TaskListError::NotReady {
                id: id.to_string(),
                status: task.status,
            });
        }
        task.status = TaskStatus::InProgress;
        Ok(())
    }

    pub fn complete(&mut self, id: &str, result: impl Into<String>) -> Result<(), TaskListError> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Completed;
        task.result = Some(result.into());
        self.refresh();
        Ok(())
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<(), TaskListError> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Failed;
        task.result = Some(error.into());
        self.refresh();
        Ok(())
    }

    /// True when no task can make further progress.
    pub fn is_settled(&self) -> bool {
        !self
            .tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, TaskListError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TaskListError::Unknown(id.to_string()))
    }
}
