//! Credential provider interface.
//!
//! Credentials are opaque to the execution core; the mapper hands `%name`
//! lookups to the provider and passes whatever comes back to the step.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Supplies named credentials to `%` parameter mappings.
pub trait CredentialProvider: Send + Sync {
    /// Looks up a credential by name.
    fn named_credential(&self, name: &str) -> Option<Value>;
}

/// A provider with no credentials. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn named_credential(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// An in-memory provider backed by a name/value map.
#[derive(Debug, Default)]
pub struct MapCredentialProvider {
    credentials: RwLock<HashMap<String, Value>>,
}

impl MapCredentialProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential.
    pub fn insert(&self, name: impl Into<String>, value: Value) {
        self.credentials.write().insert(name.into(), value);
    }
}

impl CredentialProvider for MapCredentialProvider {
    fn named_credential(&self, name: &str) -> Option<Value> {
        self.credentials.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_credentials() {
        assert!(NoCredentials.named_credential("anything").is_none());
    }

    #[test]
    fn test_map_provider() {
        let provider = MapCredentialProvider::new();
        provider.insert("api-key", json!({"token": "secret"}));

        assert_eq!(
            provider.named_credential("api-key"),
            Some(json!({"token": "secret"}))
        );
        assert!(provider.named_credential("missing").is_none());
    }
}
