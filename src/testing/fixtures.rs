//! Pre-wired contexts for pipeline tests.

use std::sync::Arc;
use uuid::Uuid;

use super::mocks::{register_mocks, MockAccounting};
use crate::context::ExecutionContext;
use crate::events::CollectingListener;
use crate::pipeline::PipelineRegistry;
use crate::session::{ConverterRegistry, InMemorySessionStore, SessionContext};
use crate::steps::StepRegistry;

/// A test harness bundling registries, a persistent in-memory store,
/// a collecting listener, and mock accounting.
pub struct TestHarness {
    /// Step registry preloaded with the standard mocks.
    pub steps: Arc<StepRegistry>,
    /// Empty pipeline registry for step-group tests.
    pub pipelines: Arc<PipelineRegistry>,
    /// In-memory session store shared across runs.
    pub store: Arc<InMemorySessionStore>,
    /// Collecting lifecycle listener.
    pub listener: Arc<CollectingListener>,
    /// The session id used by every context the harness builds.
    pub session_id: Uuid,
    accounting: Arc<MockAccounting>,
    converters: Arc<ConverterRegistry>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with the standard mock set registered.
    #[must_use]
    pub fn new() -> Self {
        let steps = Arc::new(StepRegistry::new());
        let accounting = Arc::new(MockAccounting::new());
        register_mocks(&steps, accounting.clone());

        Self {
            steps,
            pipelines: Arc::new(PipelineRegistry::new()),
            store: Arc::new(InMemorySessionStore::new()),
            listener: Arc::new(CollectingListener::new()),
            session_id: Uuid::new_v4(),
            accounting,
            converters: Arc::new(ConverterRegistry::new()),
        }
    }

    /// Builds a context for the first run of the harness session.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        self.context_for_run(1)
    }

    /// Builds a context for a specific run of the harness session.
    ///
    /// Successive runs against the same store exercise restart folding.
    #[must_use]
    pub fn context_for_run(&self, run_id: i64) -> ExecutionContext {
        ExecutionContext::new()
            .with_steps(self.steps.clone())
            .with_pipelines(self.pipelines.clone())
            .with_listener(self.listener.clone())
            .with_session(SessionContext::new(
                self.store.clone(),
                self.converters.clone(),
                self.session_id,
                run_id,
            ))
    }

    /// The number of times a mock step was invoked.
    #[must_use]
    pub fn invocations(&self, name: &str) -> usize {
        self.accounting.invocations(name)
    }

    /// The highest number of mock steps running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.accounting.peak_concurrency()
    }
}

/// A ready-made context with mocks registered and a no-history session.
#[must_use]
pub fn test_context() -> ExecutionContext {
    TestHarness::new().context()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_builds_contexts_for_runs() {
        let harness = TestHarness::new();
        let first = harness.context();
        let second = harness.context_for_run(2);

        assert_eq!(first.session.session_id, second.session.session_id);
        assert_eq!(first.session.run_id, 1);
        assert_eq!(second.session.run_id, 2);
    }

    #[test]
    fn test_test_context_has_mocks() {
        let ctx = test_context();
        assert!(ctx.steps.get("flow.Common.echo").is_some());
    }
}
