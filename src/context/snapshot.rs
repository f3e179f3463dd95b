//! Immutable execution context snapshots.
//!
//! Every mutating operation returns a new snapshot; previous snapshots
//! remain valid. Fork slots and step-groups clone the context freely and
//! hand their snapshots back through [`ExecutionContext::merge`].

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::keys::StateKey;
use crate::core::{AuditLedger, StepResponse};
use crate::credentials::{CredentialProvider, NoCredentials};
use crate::events::{NoopListener, PipelineListener};
use crate::mapper::ParameterMapper;
use crate::pipeline::PipelineRegistry;
use crate::session::SessionContext;
use crate::steps::StepRegistry;

/// Reserved global holding the link submap of indirect global mappings.
pub const GLOBAL_LINKS_KEY: &str = "GlobalLinks";

/// Parameters scoped to one pipeline id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineParameter {
    /// The pipeline the parameters belong to.
    pub pipeline_id: String,
    /// Parameter values by name.
    pub parameters: HashMap<String, Value>,
}

impl PipelineParameter {
    /// Creates parameters for a pipeline.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, parameters: HashMap<String, Value>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            parameters,
        }
    }
}

/// Snapshot of everything a step execution can observe.
///
/// Carries the data (globals, per-pipeline parameters, step results,
/// audits, current position) and the collaborators (listener, mapper,
/// registries, credentials, session façade).
#[derive(Clone)]
pub struct ExecutionContext {
    /// Global values, including the reserved [`GLOBAL_LINKS_KEY`] submap.
    pub globals: HashMap<String, Value>,
    /// Per-pipeline parameters.
    pub parameters: Vec<PipelineParameter>,
    /// Step results keyed by canonical state key.
    pub step_results: HashMap<StateKey, StepResponse>,
    /// Timing audits.
    pub audits: AuditLedger,
    /// The position currently executing.
    pub current_state: Option<StateKey>,
    /// Lifecycle listener.
    pub listener: Arc<dyn PipelineListener>,
    /// Parameter mapper.
    pub mapper: ParameterMapper,
    /// Step function registry.
    pub steps: Arc<StepRegistry>,
    /// Pipeline definitions, for step-groups and `&` mappings.
    pub pipelines: Arc<PipelineRegistry>,
    /// Credential provider for `%` mappings.
    pub credentials: Arc<dyn CredentialProvider>,
    /// Session persistence façade.
    pub session: SessionContext,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Creates an empty context with no-op collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self {
            globals: HashMap::new(),
            parameters: Vec::new(),
            step_results: HashMap::new(),
            audits: AuditLedger::new(),
            current_state: None,
            listener: Arc::new(NoopListener),
            mapper: ParameterMapper::new(),
            steps: Arc::new(StepRegistry::new()),
            pipelines: Arc::new(PipelineRegistry::new()),
            credentials: Arc::new(NoCredentials),
            session: SessionContext::detached(),
        }
    }

    /// Sets the lifecycle listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Sets the step registry.
    #[must_use]
    pub fn with_steps(mut self, steps: Arc<StepRegistry>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the pipeline registry.
    #[must_use]
    pub fn with_pipelines(mut self, pipelines: Arc<PipelineRegistry>) -> Self {
        self.pipelines = pipelines;
        self
    }

    /// Sets the credential provider.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the session façade.
    #[must_use]
    pub fn with_session(mut self, session: SessionContext) -> Self {
        self.session = session;
        self
    }

    /// Adds or replaces a global.
    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Adds parameters for a pipeline, replacing any prior entry.
    #[must_use]
    pub fn with_pipeline_parameters(
        mut self,
        pipeline_id: impl Into<String>,
        parameters: HashMap<String, Value>,
    ) -> Self {
        let pipeline_id = pipeline_id.into();
        self.parameters.retain(|p| p.pipeline_id != pipeline_id);
        self.parameters
            .push(PipelineParameter::new(pipeline_id, parameters));
        self
    }

    /// Sets the current execution position.
    #[must_use]
    pub fn with_current_state(mut self, key: StateKey) -> Self {
        self.current_state = Some(key);
        self
    }

    /// Looks up a global.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Looks up a global as a string slice.
    #[must_use]
    pub fn global_str(&self, name: &str) -> Option<&str> {
        self.global(name).and_then(Value::as_str)
    }

    /// Looks up the link mapping for a global name, when present.
    #[must_use]
    pub fn global_link(&self, name: &str) -> Option<&str> {
        self.globals
            .get(GLOBAL_LINKS_KEY)
            .and_then(Value::as_object)
            .and_then(|links| links.get(name))
            .and_then(Value::as_str)
    }

    /// Returns the parameters declared for a pipeline id.
    #[must_use]
    pub fn pipeline_parameters(&self, pipeline_id: &str) -> Option<&HashMap<String, Value>> {
        self.parameters
            .iter()
            .find(|p| p.pipeline_id == pipeline_id)
            .map(|p| &p.parameters)
    }

    /// Finds the step result stored at a key.
    #[must_use]
    pub fn step_result(&self, key: &StateKey) -> Option<&StepResponse> {
        self.step_results.get(key)
    }

    /// Scans step results by bare step id, fork-aware.
    ///
    /// Entries are ordered by fork slot index; plain entries come first.
    #[must_use]
    pub fn step_results_by_id(&self, step_id: &str) -> Vec<(&StateKey, &StepResponse)> {
        let mut hits: Vec<(&StateKey, &StepResponse)> = self
            .step_results
            .iter()
            .filter(|(key, _)| key.step_id.as_deref() == Some(step_id))
            .collect();
        hits.sort_by_key(|(key, _)| key.fork.as_ref().map_or(0, |f| f.index + 1));
        hits
    }

    /// Stores a step response and applies its global mutations.
    ///
    /// Named returns prefixed `$globals.` overwrite the named global;
    /// `$globalLink.` entries update the [`GLOBAL_LINKS_KEY`] submap.
    #[must_use]
    pub fn with_step_result(mut self, key: StateKey, response: StepResponse) -> Self {
        for (name, value) in response.global_updates() {
            self.globals.insert(name.to_string(), value.clone());
        }
        let links: Vec<(String, Value)> = response
            .global_link_updates()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        if !links.is_empty() {
            let entry = self
                .globals
                .entry(GLOBAL_LINKS_KEY.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(map) = entry {
                for (name, value) in links {
                    map.insert(name, value);
                }
            }
        }
        self.step_results.insert(key, response);
        self
    }

    /// Merges another context into this one.
    ///
    /// Step results are additive by canonical key with existing entries
    /// winning; incoming results that mutate globals apply their
    /// mutations even while merging. Audits upsert by key. Collaborators
    /// of the receiver are preserved.
    #[must_use]
    pub fn merge(mut self, incoming: &ExecutionContext) -> Self {
        let mut added: Vec<(StateKey, StepResponse)> = incoming
            .step_results
            .iter()
            .filter(|(key, _)| !self.step_results.contains_key(*key))
            .map(|(key, response)| (key.clone(), response.clone()))
            .collect();
        added.sort_by_key(|(key, _)| key.canonical());
        for (key, response) in added {
            self = self.with_step_result(key, response);
        }
        self.audits.merge(&incoming.audits);
        self
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("globals", &self.globals.len())
            .field("parameters", &self.parameters.len())
            .field("step_results", &self.step_results.len())
            .field("audits", &self.audits.len())
            .field("current_state", &self.current_state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ForkData;
    use serde_json::json;

    fn key(step: &str) -> StateKey {
        StateKey::pipeline("p1").with_step(step)
    }

    #[test]
    fn test_with_step_result_applies_globals() {
        let response = StepResponse::of(json!("done")).with_named("$globals.x", json!(42));
        let ctx = ExecutionContext::new().with_step_result(key("a"), response);

        assert_eq!(ctx.global("x"), Some(&json!(42)));
        assert_eq!(
            ctx.step_result(&key("a")).unwrap().primary,
            Some(json!("done"))
        );
    }

    #[test]
    fn test_with_step_result_applies_global_links() {
        let response = StepResponse::none().with_named("$globalLink.src", json!("!raw.path"));
        let ctx = ExecutionContext::new().with_step_result(key("a"), response);

        assert_eq!(ctx.global_link("src"), Some("!raw.path"));
    }

    #[test]
    fn test_merge_is_additive_and_existing_wins() {
        let base = ExecutionContext::new()
            .with_step_result(key("a"), StepResponse::of(json!("original")));

        let incoming = ExecutionContext::new()
            .with_step_result(key("a"), StepResponse::of(json!("replacement")))
            .with_step_result(key("b"), StepResponse::of(json!("new")));

        let merged = base.merge(&incoming);
        assert_eq!(
            merged.step_result(&key("a")).unwrap().primary,
            Some(json!("original"))
        );
        assert_eq!(
            merged.step_result(&key("b")).unwrap().primary,
            Some(json!("new"))
        );
    }

    #[test]
    fn test_merge_applies_incoming_global_mutations() {
        let base = ExecutionContext::new();
        let incoming = ExecutionContext::new().with_step_result(
            key("a"),
            StepResponse::of(json!(1)).with_named("$globals.count", json!(7)),
        );

        let merged = base.merge(&incoming);
        assert_eq!(merged.global("count"), Some(&json!(7)));
    }

    #[test]
    fn test_merge_identity() {
        let ctx = ExecutionContext::new()
            .with_global("g", json!(true))
            .with_step_result(key("a"), StepResponse::of(json!(1)));
        let merged = ctx.clone().merge(&ctx);

        assert_eq!(merged.step_results, ctx.step_results);
        assert_eq!(merged.globals, ctx.globals);
        assert_eq!(merged.audits, ctx.audits);
    }

    #[test]
    fn test_step_results_by_id_orders_fork_slots() {
        let slot = |i: usize| {
            StateKey::pipeline("p1")
                .with_step("s")
                .with_fork(ForkData::new("fk", i, json!(i)))
        };
        let ctx = ExecutionContext::new()
            .with_step_result(slot(2), StepResponse::of(json!(20)))
            .with_step_result(slot(0), StepResponse::of(json!(0)))
            .with_step_result(slot(1), StepResponse::of(json!(10)));

        let hits = ctx.step_results_by_id("s");
        let indices: Vec<usize> = hits
            .iter()
            .map(|(k, _)| k.fork.as_ref().unwrap().index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_pipeline_parameters_lookup() {
        let mut params = HashMap::new();
        params.insert("threshold".to_string(), json!(5));
        let ctx = ExecutionContext::new().with_pipeline_parameters("p1", params);

        assert_eq!(
            ctx.pipeline_parameters("p1").unwrap().get("threshold"),
            Some(&json!(5))
        );
        assert!(ctx.pipeline_parameters("p2").is_none());
    }
}
