//! Canonical hierarchical identity for execution positions.
//!
//! A [`StateKey`] names any executable point: a pipeline, a step within
//! it, a fork slot, or a step nested inside a step-group. The canonical
//! string encoding is the primary key used by persistence and context
//! merges; two keys are equal exactly when their encodings are equal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies one slot of a fork.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkData {
    /// The fork group id (the enclosing fork step's id).
    pub id: String,
    /// Zero-based slot index.
    pub index: usize,
    /// The original list value assigned to this slot.
    #[serde(default)]
    pub value: Value,
}

impl ForkData {
    /// Creates fork data for a slot.
    #[must_use]
    pub fn new(id: impl Into<String>, index: usize, value: Value) -> Self {
        Self {
            id: id.into(),
            index,
            value,
        }
    }

    fn encode(&self) -> String {
        format!("f({}_{})", self.id, self.index)
    }

    fn decode(token: &str) -> Option<Self> {
        let inner = token.strip_prefix("f(")?.strip_suffix(')')?;
        let (id, index) = inner.rsplit_once('_')?;
        let index = index.parse().ok()?;
        Some(Self {
            id: id.to_string(),
            index,
            value: Value::Null,
        })
    }
}

/// Canonical identity of an execution position.
///
/// The encoding is `<parent?>.<pipelineId>[.<stepId>][.f(<forkId>_<index>)]`.
/// Step and pipeline ids must not contain `.`; the dot is the encoding
/// separator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateKey {
    /// The pipeline id.
    pub pipeline_id: String,
    /// The step id, when the key names a step rather than a pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Fork slot data, when the key sits inside a fork.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork: Option<ForkData>,
    /// The key of the enclosing step-group step, for nested executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<StateKey>>,
}

impl StateKey {
    /// Creates a pipeline-level key.
    #[must_use]
    pub fn pipeline(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            step_id: None,
            fork: None,
            parent: None,
        }
    }

    /// Returns a copy naming a step within the pipeline.
    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Returns a copy carrying fork slot data.
    #[must_use]
    pub fn with_fork(mut self, fork: ForkData) -> Self {
        self.fork = Some(fork);
        self
    }

    /// Returns a copy nested under a step-group key.
    #[must_use]
    pub fn with_parent(mut self, parent: StateKey) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// The canonical string encoding.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if let Some(parent) = &self.parent {
            out.push_str(&parent.canonical());
            out.push('.');
        }
        out.push_str(&self.pipeline_id);
        if let Some(step) = &self.step_id {
            out.push('.');
            out.push_str(step);
        }
        if let Some(fork) = &self.fork {
            out.push('.');
            out.push_str(&fork.encode());
        }
        out
    }

    /// Decodes a canonical encoding back into a key.
    ///
    /// Fork slot values are not carried by the encoding and decode as
    /// `Null`.
    #[must_use]
    pub fn parse(encoded: &str) -> Option<Self> {
        let mut current: Option<StateKey> = None;
        for token in encoded.split('.') {
            if token.is_empty() {
                return None;
            }
            if let Some(fork) = ForkData::decode(token) {
                current.as_mut()?.fork = Some(fork);
                continue;
            }
            current = Some(match current {
                None => StateKey::pipeline(token),
                Some(mut key) => {
                    if key.step_id.is_none() && key.fork.is_none() {
                        key.step_id = Some(token.to_string());
                        key
                    } else {
                        StateKey::pipeline(token).with_parent(key)
                    }
                }
            });
        }
        current
    }

    /// Compares two keys ignoring fork slot data.
    #[must_use]
    pub fn same_step(&self, other: &StateKey) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.fork = None;
        b.fork = None;
        a == b
    }

    /// Returns true when this key sits underneath `parent` in the
    /// canonical hierarchy.
    #[must_use]
    pub fn child_of(&self, parent: &StateKey) -> bool {
        let own = self.canonical();
        let prefix = parent.canonical();
        own.len() > prefix.len() && own.starts_with(&prefix) && own.as_bytes()[prefix.len()] == b'.'
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl PartialEq for StateKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for StateKey {}

impl Hash for StateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pipeline_key_encoding() {
        let key = StateKey::pipeline("p1");
        assert_eq!(key.canonical(), "p1");
    }

    #[test]
    fn test_step_key_encoding() {
        let key = StateKey::pipeline("p1").with_step("load");
        assert_eq!(key.canonical(), "p1.load");
    }

    #[test]
    fn test_fork_key_encoding() {
        let key = StateKey::pipeline("p1")
            .with_step("map")
            .with_fork(ForkData::new("forkStep", 2, json!("c")));
        assert_eq!(key.canonical(), "p1.map.f(forkStep_2)");
    }

    #[test]
    fn test_nested_group_encoding() {
        let outer = StateKey::pipeline("p1").with_step("group");
        let key = StateKey::pipeline("p2").with_step("inner").with_parent(outer);
        assert_eq!(key.canonical(), "p1.group.p2.inner");
    }

    #[test]
    fn test_canonical_round_trip() {
        let outer = StateKey::pipeline("p1").with_step("group");
        let key = StateKey::pipeline("p2")
            .with_step("inner")
            .with_fork(ForkData::new("fk", 0, json!(1)))
            .with_parent(outer);

        let parsed = StateKey::parse(&key.canonical()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.canonical(), key.canonical());
    }

    #[test]
    fn test_parse_rejects_empty_tokens() {
        assert!(StateKey::parse("").is_none());
        assert!(StateKey::parse("p1..a").is_none());
    }

    #[test]
    fn test_equality_by_encoding() {
        let a = StateKey::pipeline("p1")
            .with_step("s")
            .with_fork(ForkData::new("fk", 1, json!("x")));
        let b = StateKey::pipeline("p1")
            .with_step("s")
            .with_fork(ForkData::new("fk", 1, json!("different value")));

        // Fork slot values do not participate in identity.
        assert_eq!(a, b);
    }

    #[test]
    fn test_same_step_ignores_fork() {
        let plain = StateKey::pipeline("p1").with_step("s");
        let slotted = StateKey::pipeline("p1")
            .with_step("s")
            .with_fork(ForkData::new("fk", 3, json!(3)));

        assert!(plain.same_step(&slotted));
        assert_ne!(plain, slotted);
    }

    #[test]
    fn test_child_of() {
        let parent = StateKey::pipeline("p1").with_step("group");
        let child = StateKey::pipeline("p2")
            .with_step("inner")
            .with_parent(parent.clone());

        assert!(child.child_of(&parent));
        assert!(!parent.child_of(&child));

        // Prefix relation requires a segment boundary.
        let sibling = StateKey::pipeline("p1").with_step("groupX");
        assert!(!sibling.child_of(&parent));
    }
}
