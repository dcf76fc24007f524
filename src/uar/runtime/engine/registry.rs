use std::collections::HashMap;
use std::sync::Arc;

use super::step::{Invocable, StepExecutor, Workflow};

/// Named agents, teams, step bodies and workflows known to a process.
#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    agents: HashMap<String, Arc<dyn Invocable>>,
    teams: HashMap<String, Arc<dyn Invocable>>,
    executors: HashMap<String, Arc<dyn StepExecutor>>,
    workflows: HashMap<String, Arc<Workflow>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_agent(&mut self, id: impl Into<String>, agent: Arc<dyn Invocable>) {
        self.agents.insert(id.into(), agent);
    }

    pub fn register_team(&mut self, id: impl Into<String>, team: Arc<dyn Invocable>) {
        self.teams.insert(id.into(), team);
    }

    pub fn register_executor(&mut self, id: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(id.into(), executor);
    }

    pub fn register_workflow(&mut self, workflow: Workflow) {
        self.workflows
            .insert(workflow.name.clone(), Arc::new(workflow));
    }

    pub fn agent(&self, id: &str) -> Option<Arc<dyn Invocable>> {
        self.agents.get(id).cloned()
    }

    pub fn team(&self, id: &str) -> Option<Arc<dyn Invocable>> {
        self.teams.get(id).cloned()
    }

    pub fn executor(&self, id: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(id).cloned()
    }

    pub fn workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(id).cloned()
    }

    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }
}
