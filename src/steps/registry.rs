//! Step function registry and uniform invocation.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{FnStep, ScriptEngine, StepFunction};
use crate::context::ExecutionContext;
use crate::core::StepResponse;
use crate::errors::FlowError;
use crate::pipeline::{ParameterKind, StepFunctionRef};

/// A step parameter after mapping, in declaration order.
#[derive(Debug, Clone)]
pub struct ResolvedParameter {
    /// The declared name.
    pub name: String,
    /// The declared kind.
    pub kind: ParameterKind,
    /// The mapped value; `None` when the mapping resolved to nothing.
    pub value: Option<Value>,
}

/// Registry of native step functions and script engines.
///
/// Native functions are keyed by the dotted `(package, object, function)`
/// address; engines are keyed by language.
#[derive(Default)]
pub struct StepRegistry {
    functions: DashMap<String, Arc<dyn StepFunction>>,
    engines: DashMap<String, Arc<dyn ScriptEngine>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a native step function.
    pub fn register(
        &self,
        package: impl Into<String>,
        object: impl Into<String>,
        function: impl Into<String>,
        step: Arc<dyn StepFunction>,
    ) {
        let key = format!(
            "{}.{}.{}",
            package.into(),
            object.into(),
            function.into()
        );
        self.functions.insert(key, step);
    }

    /// Registers a closure as a native step function.
    pub fn register_fn<F>(
        &self,
        package: impl Into<String>,
        object: impl Into<String>,
        function: impl Into<String>,
        func: F,
    ) where
        F: Fn(&[Value], &ExecutionContext) -> Result<StepResponse, FlowError>
            + Send
            + Sync
            + 'static,
    {
        let function = function.into();
        let step = FnStep::new(function.clone(), func);
        self.register(package, object, function, Arc::new(step));
    }

    /// Registers a script engine for its language.
    pub fn register_engine(&self, engine: Arc<dyn ScriptEngine>) {
        self.engines.insert(engine.language().to_string(), engine);
    }

    /// Looks up a native function by registry key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn StepFunction>> {
        self.functions.get(key).map(|entry| entry.clone())
    }

    /// Looks up the engine for a language.
    #[must_use]
    pub fn engine(&self, language: &str) -> Option<Arc<dyn ScriptEngine>> {
        self.engines.get(language).map(|entry| entry.clone())
    }

    /// Invokes a step implementation under the uniform contract.
    ///
    /// Native functions receive the resolved values positionally in
    /// declaration order, absent mappings passed as `Null`. Scripted
    /// steps receive the first script-typed parameter as the source and
    /// every other resolved parameter as a named binding.
    ///
    /// # Errors
    ///
    /// Errors that are not already invocation failures or control
    /// signals are wrapped as [`FlowError::StepInvocation`] carrying the
    /// current state.
    pub async fn invoke(
        &self,
        function: &StepFunctionRef,
        args: &[ResolvedParameter],
        ctx: &ExecutionContext,
    ) -> Result<StepResponse, FlowError> {
        let result = match function {
            StepFunctionRef::Native {
                package,
                object,
                function,
            } => {
                let key = format!("{package}.{object}.{function}");
                let Some(step) = self.get(&key) else {
                    return Err(FlowError::invocation(
                        format!("no registered step function '{key}'"),
                        ctx.current_state.clone(),
                    ));
                };
                debug!(function = %key, args = args.len(), "invoking native step");
                let positional: Vec<Value> = args
                    .iter()
                    .map(|arg| arg.value.clone().unwrap_or(Value::Null))
                    .collect();
                step.invoke(&positional, ctx).await
            }
            StepFunctionRef::Script { language } => {
                let Some(engine) = self.engine(language) else {
                    return Err(FlowError::invocation(
                        format!("no script engine registered for '{language}'"),
                        ctx.current_state.clone(),
                    ));
                };
                let Some(source) = args
                    .iter()
                    .find(|arg| arg.kind == ParameterKind::Script)
                    .and_then(|arg| arg.value.as_ref())
                    .and_then(Value::as_str)
                else {
                    return Err(FlowError::invocation(
                        "scripted step declares no script parameter",
                        ctx.current_state.clone(),
                    ));
                };
                let bindings: HashMap<String, Value> = args
                    .iter()
                    .filter(|arg| arg.kind != ParameterKind::Script)
                    .filter_map(|arg| {
                        arg.value.clone().map(|value| (arg.name.clone(), value))
                    })
                    .collect();
                debug!(language, bindings = bindings.len(), "evaluating scripted step");
                engine
                    .evaluate(source, &bindings, ctx)
                    .await
                    .map(StepResponse::from_raw)
            }
        };
        result.map_err(|err| err.into_invocation(ctx.current_state.clone()))
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("functions", &self.functions.len())
            .field("engines", &self.engines.len())
            .finish()
    }
}
