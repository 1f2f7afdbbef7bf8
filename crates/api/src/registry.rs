//! Decoding resource envelopes.
//!
//! Resources travel as JSON objects of the form `{"type": <tag>, ...}`.  The
//! registry maps each known tag to a constructor for the matching concrete
//! type; it is built once at startup.

use ferry_core::transport::{self, TRANSPORT_TYPES};
use ferry_core::{Bridge, Resource, Transport};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("resource envelope has no `type` field")]
    MissingType,
    #[error("unknown resource type `{0}`")]
    UnknownType(String),
    #[error("malformed resource envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("resource `{0}` is invalid")]
    Invalid(String),
}

type Factory = fn(Value) -> Result<Box<dyn Resource>, serde_json::Error>;

fn make_transport(value: Value) -> Result<Box<dyn Resource>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<Transport>(value)?))
}

fn make_bridge(value: Value) -> Result<Box<dyn Resource>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<Bridge>(value)?))
}

/// A tag-indexed table of resource constructors.
pub struct ResourceRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        let mut factories: HashMap<&'static str, Factory> = HashMap::new();
        factories.insert(transport::RESOURCE_TYPE_VANILLA, make_bridge);
        for tag in TRANSPORT_TYPES {
            factories.insert(*tag, make_transport);
        }
        Self { factories }
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a single resource envelope into its concrete type.
    pub fn decode(&self, value: Value) -> Result<Box<dyn Resource>, RegistryError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(RegistryError::MissingType)?;
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| RegistryError::UnknownType(tag.to_string()))?;
        Ok(factory(value)?)
    }

    /// Decodes a batch of envelopes, rejecting the whole batch on the first
    /// malformed or invalid entry.
    pub fn decode_all(&self, values: Vec<Value>) -> Result<Vec<Box<dyn Resource>>, RegistryError> {
        let mut resources = Vec::with_capacity(values.len());
        for value in values {
            let r = self.decode(value)?;
            if !r.is_valid() {
                return Err(RegistryError::Invalid(r.to_string()));
            }
            resources.push(r);
        }
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_without_type_is_rejected() {
        let registry = ResourceRegistry::new();
        assert!(matches!(
            registry.decode(json!({})),
            Err(RegistryError::MissingType)
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = ResourceRegistry::new();
        assert!(matches!(
            registry.decode(json!({"type": "foo"})),
            Err(RegistryError::UnknownType(_))
        ));
    }

    #[test]
    fn incomplete_resource_is_rejected() {
        let registry = ResourceRegistry::new();
        assert!(matches!(
            registry.decode(json!({"type": "obfs4"})),
            Err(RegistryError::Malformed(_))
        ));
    }

    #[test]
    fn valid_envelopes_decode() {
        let registry = ResourceRegistry::new();
        let envelope = json!({"type": "obfs4", "address": "1.2.3.4", "port": 1234});
        let resources = registry
            .decode_all(vec![envelope.clone(), envelope])
            .expect("valid envelopes");
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].type_tag(), "obfs4");
    }

    #[test]
    fn invalid_resource_rejects_the_batch() {
        let registry = ResourceRegistry::new();
        let valid = json!({"type": "obfs4", "address": "1.2.3.4", "port": 1234});
        let invalid = json!({"type": "obfs4", "address": "1.2.3.4", "port": 0});
        assert!(matches!(
            registry.decode_all(vec![valid, invalid]),
            Err(RegistryError::Invalid(_))
        ));
    }

    #[test]
    fn vanilla_decodes_to_bridge() {
        let registry = ResourceRegistry::new();
        let envelope = json!({
            "type": "vanilla",
            "address": "1.2.3.4",
            "port": 9001,
            "fingerprint": "0123456789ABCDEF0123456789ABCDEF01234567",
        });
        let r = registry.decode(envelope).expect("valid envelope");
        assert_eq!(r.type_tag(), "vanilla");
        assert_eq!(
            r.fingerprint(),
            Some("0123456789ABCDEF0123456789ABCDEF01234567")
        );
    }
}
