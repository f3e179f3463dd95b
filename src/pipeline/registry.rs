//! Registry of pipeline definitions.

use dashmap::DashMap;

use super::spec::Pipeline;

/// Thread-safe store of pipeline definitions keyed by id.
///
/// Step-groups and `&pipelineId` mappings resolve through this registry.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: DashMap<String, Pipeline>,
}

impl PipelineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline, replacing any prior definition with its id.
    pub fn register(&self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.id.clone(), pipeline);
    }

    /// Fetches a pipeline definition by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Pipeline> {
        self.pipelines.get(id).map(|entry| entry.clone())
    }

    /// Returns true when a pipeline with the id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.pipelines.contains_key(id)
    }

    /// Returns the number of registered pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Returns true when no pipelines are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = PipelineRegistry::new();
        registry.register(Pipeline::new("p1"));

        assert!(registry.contains("p1"));
        assert_eq!(registry.get("p1").unwrap().id, "p1");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_register_replaces() {
        let registry = PipelineRegistry::new();
        registry.register(Pipeline::new("p1"));
        registry.register(Pipeline::new("p1").with_name("second"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("p1").unwrap().name.as_deref(), Some("second"));
    }
}
