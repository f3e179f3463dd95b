//! Step implementations and the uniform invocation contract.
//!
//! Steps are the units of work a pipeline drives. Native functions are
//! addressed by `(package, object, function)`; scripted steps delegate to
//! a [`ScriptEngine`] registered per language. Whatever a step body
//! returns is marshalled into a [`StepResponse`].

mod registry;

pub use registry::{ResolvedParameter, StepRegistry};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::context::ExecutionContext;
use crate::core::StepResponse;
use crate::errors::FlowError;

/// A native step implementation.
///
/// Positional arguments arrive in declaration order; the execution
/// context is always supplied as the final argument and may be ignored.
#[async_trait]
pub trait StepFunction: Send + Sync {
    /// Executes the step body.
    async fn invoke(
        &self,
        args: &[Value],
        ctx: &ExecutionContext,
    ) -> Result<StepResponse, FlowError>;
}

/// An external engine evaluating scripted steps for one language.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// The language this engine evaluates.
    fn language(&self) -> &str;

    /// Evaluates a script with the given bindings.
    async fn evaluate(
        &self,
        source: &str,
        bindings: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, FlowError>;
}

/// A closure-backed step function.
pub struct FnStep<F>
where
    F: Fn(&[Value], &ExecutionContext) -> Result<StepResponse, FlowError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStep<F>
where
    F: Fn(&[Value], &ExecutionContext) -> Result<StepResponse, FlowError> + Send + Sync,
{
    /// Creates a closure-backed step function.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStep<F>
where
    F: Fn(&[Value], &ExecutionContext) -> Result<StepResponse, FlowError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> StepFunction for FnStep<F>
where
    F: Fn(&[Value], &ExecutionContext) -> Result<StepResponse, FlowError> + Send + Sync,
{
    async fn invoke(
        &self,
        args: &[Value],
        ctx: &ExecutionContext,
    ) -> Result<StepResponse, FlowError> {
        (self.func)(args, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_step_invocation() {
        let step = FnStep::new("double", |args, _ctx| {
            let n = args
                .first()
                .and_then(Value::as_i64)
                .unwrap_or_default();
            Ok(StepResponse::of(json!(n * 2)))
        });

        let ctx = ExecutionContext::new();
        let response = step.invoke(&[json!(21)], &ctx).await.unwrap();
        assert_eq!(response.primary, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_fn_step_error_propagates() {
        let step = FnStep::new("boom", |_args, _ctx| {
            Err(FlowError::invocation("deliberate failure", None))
        });

        let ctx = ExecutionContext::new();
        assert!(step.invoke(&[], &ctx).await.is_err());
    }
}
