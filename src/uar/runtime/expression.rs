//! Sandboxed expressions for conditions, router selectors and loop exits.
//!
//! Expressions are minijinja expressions: pure, side-effect-free and bounded
//! by a fuel budget. Context values are handed over as data, so content
//! coming from a session or a previous step can never be executed.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::value::ValueKind;
use minijinja::{Environment, Value};
use serde::Serialize;
use serde_json::Map;

use crate::error::ExpressionError;
use crate::uar::domain::steps::{StepInput, StepOutput};

/// Default evaluation budget for one expression.
pub const DEFAULT_FUEL: u64 = 50_000;

/// Compiles expressions against one shared, locked-down environment.
#[derive(Debug, Clone)]
pub struct ExpressionEngine {
    env: Arc<Environment<'static>>,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new(Some(DEFAULT_FUEL))
    }
}

impl ExpressionEngine {
    pub fn new(fuel: Option<u64>) -> Self {
        let mut env = Environment::new();
        env.set_fuel(fuel);
        Self { env: Arc::new(env) }
    }

    /// Parse `source`, failing fast on syntax errors.
    pub fn compile(&self, source: &str) -> Result<CompiledExpression, ExpressionError> {
        self.env
            .compile_expression(source)
            .map_err(|e| ExpressionError::Compile {
                expression: source.to_string(),
                message: e.to_string(),
            })?;
        Ok(CompiledExpression {
            source: Arc::from(source),
            env: Arc::clone(&self.env),
        })
    }
}

/// An expression that is known to parse.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: Arc<str>,
    env: Arc<Environment<'static>>,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
        let expr = self
            .env
            .compile_expression(&self.source)
            .map_err(|e| self.eval_error(&e))?;
        expr.eval(Value::from_serialize(ctx))
            .map_err(|e| self.eval_error(&e))
    }

    /// Evaluate as a predicate. Non-boolean results fall back to truthiness.
    pub fn evaluate_bool(&self, ctx: &ExpressionContext<'_>) -> Result<bool, ExpressionError> {
        let value = self.evaluate(ctx)?;
        if value.kind() == ValueKind::Bool {
            return Ok(value.is_true());
        }
        let coerced = !value.is_undefined() && value.is_true();
        tracing::warn!(
            expression = %self.source,
            kind = %value.kind(),
            coerced,
            "Expression did not return a boolean; coercing by truthiness"
        );
        Ok(coerced)
    }

    /// Evaluate as a route selector. Returns `None` when nothing was selected.
    pub fn evaluate_selector(
        &self,
        ctx: &ExpressionContext<'_>,
    ) -> Result<Option<String>, ExpressionError> {
        let value = self.evaluate(ctx)?;
        if let Some(name) = value.as_str() {
            return Ok(Some(name.to_string()));
        }
        if value.is_undefined() || value.is_none() {
            tracing::warn!(expression = %self.source, "Router selector produced no value");
            return Ok(None);
        }
        let coerced = value.to_string();
        tracing::warn!(
            expression = %self.source,
            kind = %value.kind(),
            coerced = %coerced,
            "Router selector did not return a string; using its string form"
        );
        Ok(Some(coerced))
    }

    fn eval_error(&self, err: &minijinja::Error) -> ExpressionError {
        ExpressionError::Evaluate {
            expression: self.source.to_string(),
            message: err.to_string(),
        }
    }
}

/// Variables visible to an expression.
#[derive(Debug, Serialize)]
pub struct ExpressionContext<'a> {
    pub input: &'a str,
    pub previous_step_content: Option<&'a str>,
    pub previous_step_outputs: &'a BTreeMap<String, String>,
    pub additional_data: &'a serde_json::Value,
    pub session_state: Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_outputs: Option<&'a [StepOutput]>,
}

impl<'a> ExpressionContext<'a> {
    pub fn from_input(input: &'a StepInput) -> Self {
        Self {
            input: &input.input,
            previous_step_content: input.previous_step_content.as_deref(),
            previous_step_outputs: &input.previous_step_outputs,
            additional_data: &input.additional_data,
            session_state: input.session_state.snapshot(),
            current_iteration: None,
            max_iterations: None,
            iteration_outputs: None,
        }
    }

    #[must_use]
    pub fn with_loop(
        mut self,
        current_iteration: u32,
        max_iterations: u32,
        iteration_outputs: &'a [StepOutput],
    ) -> Self {
        self.current_iteration = Some(current_iteration);
        self.max_iterations = Some(max_iterations);
        self.iteration_outputs = Some(iteration_outputs);
        self
    }
}
