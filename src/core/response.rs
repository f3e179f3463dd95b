//! Step response type with named-return conventions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Named-return prefix that mutates a global in the caller's context.
pub const GLOBALS_PREFIX: &str = "$globals.";

/// Named-return prefix that mutates the `GlobalLinks` submap.
pub const GLOBAL_LINK_PREFIX: &str = "$globalLink.";

/// The value produced by a single step execution.
///
/// A response carries an optional primary return and a map of named
/// returns. Named returns whose keys use [`GLOBALS_PREFIX`] or
/// [`GLOBAL_LINK_PREFIX`] mutate the execution context when the response
/// is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    /// The primary return value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<Value>,

    /// Named secondary returns.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub named: HashMap<String, Value>,
}

impl StepResponse {
    /// Creates an empty response.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a response with a primary return.
    #[must_use]
    pub fn of(value: Value) -> Self {
        Self {
            primary: Some(value),
            named: HashMap::new(),
        }
    }

    /// Creates a response from a raw value produced by a step body.
    ///
    /// `Null` maps to an absent primary; everything else becomes the
    /// primary return.
    #[must_use]
    pub fn from_raw(value: Value) -> Self {
        match value {
            Value::Null => Self::none(),
            other => Self::of(other),
        }
    }

    /// Adds a named return.
    #[must_use]
    pub fn with_named(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named.insert(name.into(), value);
        self
    }

    /// Returns true when neither a primary nor named returns are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.named.is_empty()
    }

    /// Iterates over `$globals.<name>` entries as `(name, value)` pairs.
    pub fn global_updates(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.named.iter().filter_map(|(key, value)| {
            key.strip_prefix(GLOBALS_PREFIX).map(|name| (name, value))
        })
    }

    /// Iterates over `$globalLink.<name>` entries as `(name, value)` pairs.
    pub fn global_link_updates(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.named.iter().filter_map(|(key, value)| {
            key.strip_prefix(GLOBAL_LINK_PREFIX).map(|name| (name, value))
        })
    }

    /// Returns true when any named return mutates globals or links.
    #[must_use]
    pub fn mutates_globals(&self) -> bool {
        self.named
            .keys()
            .any(|k| k.starts_with(GLOBALS_PREFIX) || k.starts_with(GLOBAL_LINK_PREFIX))
    }
}

impl From<Value> for StepResponse {
    fn from(value: Value) -> Self {
        Self::from_raw(value)
    }
}

impl From<Option<Value>> for StepResponse {
    fn from(value: Option<Value>) -> Self {
        Self {
            primary: value,
            named: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_raw_null_is_empty() {
        let response = StepResponse::from_raw(Value::Null);
        assert!(response.is_empty());
    }

    #[test]
    fn test_from_raw_wraps_primary() {
        let response = StepResponse::from_raw(json!(42));
        assert_eq!(response.primary, Some(json!(42)));
        assert!(response.named.is_empty());
    }

    #[test]
    fn test_global_updates() {
        let response = StepResponse::of(json!("done"))
            .with_named("$globals.x", json!(42))
            .with_named("plain", json!("kept"));

        let updates: Vec<_> = response.global_updates().collect();
        assert_eq!(updates, vec![("x", &json!(42))]);
        assert!(response.mutates_globals());
    }

    #[test]
    fn test_global_link_updates() {
        let response =
            StepResponse::none().with_named("$globalLink.source", json!("!rawData.path"));

        let links: Vec<_> = response.global_link_updates().collect();
        assert_eq!(links, vec![("source", &json!("!rawData.path"))]);
    }

    #[test]
    fn test_plain_named_returns_do_not_mutate() {
        let response = StepResponse::none().with_named("count", json!(3));
        assert!(!response.mutates_globals());
        assert_eq!(response.global_updates().count(), 0);
    }

    #[test]
    fn test_serialization_round_trip() {
        let response = StepResponse::of(json!({"a": 1})).with_named("b", json!(true));
        let json = serde_json::to_string(&response).unwrap();
        let parsed: StepResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(response, parsed);
    }
}
