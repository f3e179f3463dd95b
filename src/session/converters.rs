//! Pluggable value serialization for session persistence.
//!
//! Converters are tried in declaration order; the last entry is a
//! universal JSON default. The selected converter's name is stored next
//! to the bytes so deserialization can locate it.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::errors::FlowError;

/// A named pair of byte codecs selected by a `can_convert` predicate.
pub trait ValueConverter: Send + Sync {
    /// The unique converter name stored alongside serialized bytes.
    fn name(&self) -> &str;

    /// Returns true when this converter accepts the value.
    fn can_convert(&self, value: &Value) -> bool;

    /// Serializes the value to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on codec failure.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, FlowError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on codec failure.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, FlowError>;
}

/// The universal JSON converter. Accepts every value.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl ValueConverter for JsonConverter {
    fn name(&self) -> &str {
        "json"
    }

    fn can_convert(&self, _value: &Value) -> bool {
        true
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, FlowError> {
        serde_json::to_vec(value).map_err(Into::into)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, FlowError> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }
}

/// Ordered registry of converters, ending in the universal default.
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn ValueConverter>>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self {
            converters: vec![Arc::new(JsonConverter)],
        }
    }
}

impl ConverterRegistry {
    /// Creates a registry holding only the universal JSON default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with no converters at all.
    ///
    /// Values then have nowhere to go and are dropped with a warning;
    /// useful for exercising the drop path.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            converters: Vec::new(),
        }
    }

    /// Inserts a converter ahead of the universal default.
    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        let at = self.converters.len().saturating_sub(1);
        self.converters.insert(at, converter);
        self
    }

    /// Finds the first converter accepting the value.
    #[must_use]
    pub fn find_for(&self, value: &Value) -> Option<Arc<dyn ValueConverter>> {
        self.converters
            .iter()
            .find(|c| c.can_convert(value))
            .cloned()
    }

    /// Finds a converter by stored name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn ValueConverter>> {
        self.converters.iter().find(|c| c.name() == name).cloned()
    }

    /// Serializes a value, returning the converter name and bytes.
    ///
    /// Returns `None` (after warning) when no converter accepts the
    /// value; persistence drops it without blocking execution.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] when the selected codec fails.
    pub fn serialize(&self, value: &Value) -> Result<Option<(String, Vec<u8>)>, FlowError> {
        match self.find_for(value) {
            Some(converter) => {
                let bytes = converter.serialize(value)?;
                Ok(Some((converter.name().to_string(), bytes)))
            }
            None => {
                warn!("no converter accepts value; dropping from persistence");
                Ok(None)
            }
        }
    }

    /// Deserializes bytes using the named converter.
    ///
    /// Returns `None` (after warning) when the converter is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] when the codec fails.
    pub fn deserialize(&self, name: &str, bytes: &[u8]) -> Result<Option<Value>, FlowError> {
        match self.by_name(name) {
            Some(converter) => converter.deserialize(bytes).map(Some),
            None => {
                warn!(converter = name, "unknown converter; skipping record");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.converters.iter().map(|c| c.name()).collect();
        f.debug_struct("ConverterRegistry")
            .field("converters", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct IntegersOnly;

    impl ValueConverter for IntegersOnly {
        fn name(&self) -> &str {
            "integers"
        }

        fn can_convert(&self, value: &Value) -> bool {
            value.is_i64()
        }

        fn serialize(&self, value: &Value) -> Result<Vec<u8>, FlowError> {
            Ok(value.to_string().into_bytes())
        }

        fn deserialize(&self, bytes: &[u8]) -> Result<Value, FlowError> {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| FlowError::session(e.to_string()))?;
            text.parse::<i64>()
                .map(Value::from)
                .map_err(|e| FlowError::session(e.to_string()))
        }
    }

    #[test]
    fn test_default_registry_round_trip() {
        let registry = ConverterRegistry::new();
        let value = json!({"nested": [1, 2, 3]});

        let (name, bytes) = registry.serialize(&value).unwrap().unwrap();
        assert_eq!(name, "json");

        let restored = registry.deserialize(&name, &bytes).unwrap().unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn test_declaration_order_before_default() {
        let registry = ConverterRegistry::new().with_converter(Arc::new(IntegersOnly));

        let (name, _) = registry.serialize(&json!(42)).unwrap().unwrap();
        assert_eq!(name, "integers");

        // Non-integers fall through to the universal default.
        let (name, _) = registry.serialize(&json!("text")).unwrap().unwrap();
        assert_eq!(name, "json");
    }

    #[test]
    fn test_empty_registry_drops_values() {
        let registry = ConverterRegistry::empty();
        assert!(registry.serialize(&json!(1)).unwrap().is_none());
    }

    #[test]
    fn test_unknown_converter_name_skips() {
        let registry = ConverterRegistry::new();
        assert!(registry.deserialize("protobuf", b"junk").unwrap().is_none());
    }
}
