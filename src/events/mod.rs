//! Lifecycle listeners.
//!
//! Listeners observe pipeline and step lifecycle events. Every event
//! except the exception event may return a modified context; `None`
//! means "no change". The composite listener applies its members in
//! declaration order, threading the context forward so later listeners
//! observe earlier listeners' edits.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

use crate::context::ExecutionContext;
use crate::errors::FlowError;
use crate::pipeline::{FlowStep, Pipeline};

/// Observes pipeline lifecycle events.
#[allow(unused_variables)]
#[async_trait]
pub trait PipelineListener: Send + Sync {
    /// Called before the first step of a pipeline executes.
    async fn pipeline_started(
        &self,
        pipeline: &Pipeline,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        Ok(None)
    }

    /// Called after a pipeline reaches a terminal state.
    async fn pipeline_finished(
        &self,
        pipeline: &Pipeline,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        Ok(None)
    }

    /// Called before each step executes.
    async fn step_started(
        &self,
        step: &FlowStep,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        Ok(None)
    }

    /// Called after each step finishes successfully.
    async fn step_finished(
        &self,
        step: &FlowStep,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        Ok(None)
    }

    /// Called when a step surfaces an exception or signal.
    async fn step_exception(&self, error: &FlowError, ctx: &ExecutionContext) {}
}

/// A listener that ignores every event. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl PipelineListener for NoopListener {}

/// Composes multiple listeners, threading context edits forward.
#[derive(Default)]
pub struct CompositeListener {
    members: Vec<Arc<dyn PipelineListener>>,
}

impl CompositeListener {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a member listener.
    #[must_use]
    pub fn with(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.members.push(listener);
        self
    }
}

macro_rules! thread_event {
    ($self:ident, $method:ident, $subject:expr, $ctx:expr) => {{
        let mut current: Option<ExecutionContext> = None;
        for member in &$self.members {
            let view = current.as_ref().unwrap_or($ctx);
            if let Some(updated) = member.$method($subject, view).await? {
                current = Some(updated);
            }
        }
        Ok(current)
    }};
}

#[async_trait]
impl PipelineListener for CompositeListener {
    async fn pipeline_started(
        &self,
        pipeline: &Pipeline,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        thread_event!(self, pipeline_started, pipeline, ctx)
    }

    async fn pipeline_finished(
        &self,
        pipeline: &Pipeline,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        thread_event!(self, pipeline_finished, pipeline, ctx)
    }

    async fn step_started(
        &self,
        step: &FlowStep,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        thread_event!(self, step_started, step, ctx)
    }

    async fn step_finished(
        &self,
        step: &FlowStep,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        thread_event!(self, step_finished, step, ctx)
    }

    async fn step_exception(&self, error: &FlowError, ctx: &ExecutionContext) {
        for member in &self.members {
            member.step_exception(error, ctx).await;
        }
    }
}

/// A listener that reports events through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

#[async_trait]
impl PipelineListener for LoggingListener {
    async fn pipeline_started(
        &self,
        pipeline: &Pipeline,
        _ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        info!(pipeline = %pipeline.id, "pipeline started");
        Ok(None)
    }

    async fn pipeline_finished(
        &self,
        pipeline: &Pipeline,
        _ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        info!(pipeline = %pipeline.id, "pipeline finished");
        Ok(None)
    }

    async fn step_started(
        &self,
        step: &FlowStep,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        info!(
            step = %step.id,
            state = ctx.current_state.as_ref().map(ToString::to_string),
            "step started"
        );
        Ok(None)
    }

    async fn step_finished(
        &self,
        step: &FlowStep,
        ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        info!(
            step = %step.id,
            state = ctx.current_state.as_ref().map(ToString::to_string),
            "step finished"
        );
        Ok(None)
    }

    async fn step_exception(&self, err: &FlowError, ctx: &ExecutionContext) {
        error!(
            state = ctx.current_state.as_ref().map(ToString::to_string),
            error = %err,
            "step exception"
        );
    }
}

/// A collecting listener for tests.
#[derive(Debug, Default)]
pub struct CollectingListener {
    events: RwLock<Vec<String>>,
}

impl CollectingListener {
    /// Creates a new collecting listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected event labels.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.read().clone()
    }

    /// Returns the number of events with the given prefix.
    #[must_use]
    pub fn count_of(&self, prefix: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn record(&self, label: String) {
        self.events.write().push(label);
    }
}

#[async_trait]
impl PipelineListener for CollectingListener {
    async fn pipeline_started(
        &self,
        pipeline: &Pipeline,
        _ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        self.record(format!("pipeline_started:{}", pipeline.id));
        Ok(None)
    }

    async fn pipeline_finished(
        &self,
        pipeline: &Pipeline,
        _ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        self.record(format!("pipeline_finished:{}", pipeline.id));
        Ok(None)
    }

    async fn step_started(
        &self,
        step: &FlowStep,
        _ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        self.record(format!("step_started:{}", step.id));
        Ok(None)
    }

    async fn step_finished(
        &self,
        step: &FlowStep,
        _ctx: &ExecutionContext,
    ) -> Result<Option<ExecutionContext>, FlowError> {
        self.record(format!("step_finished:{}", step.id));
        Ok(None)
    }

    async fn step_exception(&self, err: &FlowError, _ctx: &ExecutionContext) {
        self.record(format!("step_exception:{err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct GlobalSetter {
        name: &'static str,
        value: serde_json::Value,
    }

    #[async_trait]
    impl PipelineListener for GlobalSetter {
        async fn pipeline_started(
            &self,
            _pipeline: &Pipeline,
            ctx: &ExecutionContext,
        ) -> Result<Option<ExecutionContext>, FlowError> {
            Ok(Some(
                ctx.clone().with_global(self.name, self.value.clone()),
            ))
        }
    }

    #[tokio::test]
    async fn test_noop_listener_returns_no_change() {
        let listener = NoopListener;
        let ctx = ExecutionContext::new();
        let pipeline = Pipeline::new("p1");
        assert!(listener
            .pipeline_started(&pipeline, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_composite_threads_context_edits() {
        struct Doubler;

        #[async_trait]
        impl PipelineListener for Doubler {
            async fn pipeline_started(
                &self,
                _pipeline: &Pipeline,
                ctx: &ExecutionContext,
            ) -> Result<Option<ExecutionContext>, FlowError> {
                let doubled = ctx
                    .global("n")
                    .and_then(serde_json::Value::as_i64)
                    .map_or(0, |n| n * 2);
                Ok(Some(ctx.clone().with_global("n", json!(doubled))))
            }
        }

        let composite = CompositeListener::new()
            .with(Arc::new(GlobalSetter {
                name: "n",
                value: json!(21),
            }))
            .with(Arc::new(Doubler));

        let ctx = ExecutionContext::new();
        let pipeline = Pipeline::new("p1");
        let updated = composite
            .pipeline_started(&pipeline, &ctx)
            .await
            .unwrap()
            .unwrap();

        // The doubler observed the setter's edit.
        assert_eq!(updated.global("n"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_collecting_listener_records() {
        let listener = CollectingListener::new();
        let ctx = ExecutionContext::new();
        let pipeline = Pipeline::new("p1");
        let step = FlowStep::function(
            "a",
            crate::pipeline::StepFunctionRef::native("x", "Y", "z"),
        );

        listener.pipeline_started(&pipeline, &ctx).await.unwrap();
        listener.step_started(&step, &ctx).await.unwrap();
        listener.step_finished(&step, &ctx).await.unwrap();
        listener
            .step_exception(&FlowError::pause("checkpoint"), &ctx)
            .await;

        assert_eq!(listener.events().len(), 4);
        assert_eq!(listener.count_of("step_"), 3);
        assert_eq!(listener.count_of("step_exception"), 1);
    }
}
