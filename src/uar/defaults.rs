use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::uar::domain::steps::StepInput;
use crate::uar::runtime::engine::{Invocable, StepContext, WorkflowSpec};
use crate::uar::runtime::manager::RunManager;

pub const ECHO_AGENT: &str = "echo";

/// Streams its input back word by word.
///
/// Stands in for a model-backed agent so a fresh deployment can be exercised
/// end to end.
#[derive(Debug, Default)]
pub struct EchoAgent;

#[async_trait]
impl Invocable for EchoAgent {
    async fn invoke(&self, input: StepInput, ctx: &StepContext) -> anyhow::Result<String> {
        let text = input.latest_content().to_string();
        for (i, word) in text.split_whitespace().enumerate() {
            if i > 0 {
                ctx.emit_delta(" ");
            }
            ctx.emit_delta(word);
            ctx.checkpoint().await?;
        }
        Ok(text)
    }
}

/// Register the built-in agents.
pub fn register_default_agents(manager: &RunManager) {
    manager.register_agent(ECHO_AGENT, Arc::new(EchoAgent));
}

/// Load and compile every workflow definition under `dir`.
///
/// Definitions that fail to compile are logged and skipped; returns how many
/// were registered.
pub async fn load_workflows(manager: &RunManager, dir: &Path) -> anyhow::Result<usize> {
    let mut registered = 0;
    for spec in WorkflowSpec::load_dir(dir).await? {
        match manager.register_workflow_spec(&spec) {
            Ok(()) => registered += 1,
            Err(e) => tracing::error!(workflow = %spec.name, error = %e, "Skipping workflow"),
        }
    }
    Ok(registered)
}
