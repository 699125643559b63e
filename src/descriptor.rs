//! Per-resource configuration.
//!
//! [`ResourceOptions`] is what a caller writes when declaring a resource.
//! It is resolved against the registry [`Defaults`] once, at declaration
//! time, into an immutable [`ResourceDescriptor`].
//!
//! # Resolution
//!
//! | Setting | Option | Registry default | Fallback |
//! |---------|--------|------------------|----------|
//! | backend | `with_backend` | `Defaults::with_backend` | `Error::ConfigError` |
//! | identity field | `with_identity_field` | `Defaults::with_identity_field` | `"id"` |
//! | populate children | `with_populate_children` | `Defaults::with_populate_children` | `true` |
//! | fetch policy | `with_policy` | `Defaults::with_policy` | `Revalidate` |
//!
//! ```ignore
//! use entity_sync::{Registry, ResourceOptions, Defaults};
//!
//! let registry = Registry::init(Defaults::new().with_backend(backend));
//!
//! let documents = registry.declare::<Document>(
//!     ResourceOptions::new("/api/documents")
//!         .with_populate_children(false)
//!         .with_deserialize(|raw| uppercase_body(raw)),
//! )?;
//! ```

use crate::backend::Backend;
use crate::entity::{Identity, Record};
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::registry::Defaults;
use crate::strategy::FetchPolicy;
use std::fmt;
use std::sync::Arc;

/// Transform applied to a field record.
///
/// Used as the outgoing serialize hook (entity → request body) and the
/// incoming deserialize hook (response body → entity fields).
pub type Hook = Arc<dyn Fn(&Record) -> Record + Send + Sync>;

/// Default identity field name.
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// Options for declaring a resource.
#[derive(Clone, Default)]
pub struct ResourceOptions {
    namespace: String,
    backend: Option<Arc<dyn Backend>>,
    identity_field: Option<String>,
    populate_children: Option<bool>,
    policy: Option<FetchPolicy>,
    serialize: Option<Hook>,
    deserialize: Option<Hook>,
}

impl ResourceOptions {
    /// Options for the resource living under `namespace` (e.g. `/api/people`).
    pub fn new(namespace: impl Into<String>) -> Self {
        ResourceOptions {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Backend for this resource, overriding the registry default.
    pub fn with_backend<B: Backend + 'static>(self, backend: B) -> Self {
        self.with_shared_backend(Arc::new(backend))
    }

    pub fn with_shared_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = Some(field.into());
        self
    }

    /// Whether a fetch-all seeds each member's single-entity cache entry.
    pub fn with_populate_children(mut self, populate: bool) -> Self {
        self.populate_children = Some(populate);
        self
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Transform entity fields into the outgoing create/update body.
    pub fn with_serialize<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record) -> Record + Send + Sync + 'static,
    {
        self.serialize = Some(Arc::new(hook));
        self
    }

    /// Transform a raw response record into entity fields.
    pub fn with_deserialize<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record) -> Record + Send + Sync + 'static,
    {
        self.deserialize = Some(Arc::new(hook));
        self
    }

    /// Resolve against registry defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an empty namespace, an empty identity
    /// field, or when neither the options nor the defaults carry a backend.
    pub fn resolve(self, defaults: &Defaults) -> Result<ResourceDescriptor> {
        let namespace = CacheKeyBuilder::collection(self.namespace.trim());
        if namespace.is_empty() {
            return Err(Error::ConfigError(
                "resource declared without a namespace".to_string(),
            ));
        }

        let backend = self
            .backend
            .or_else(|| defaults.backend.clone())
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "resource {} has no backend and no default backend is configured",
                    namespace
                ))
            })?;

        let identity_field = self
            .identity_field
            .or_else(|| defaults.identity_field.clone())
            .unwrap_or_else(|| DEFAULT_IDENTITY_FIELD.to_string());
        if identity_field.is_empty() {
            return Err(Error::ConfigError(format!(
                "resource {} declared with an empty identity field",
                namespace
            )));
        }

        Ok(ResourceDescriptor {
            namespace,
            identity_field,
            backend,
            populate_children: self
                .populate_children
                .or(defaults.populate_children)
                .unwrap_or(true),
            policy: self.policy.or(defaults.policy).unwrap_or_default(),
            serialize: self.serialize,
            deserialize: self.deserialize,
        })
    }
}

/// Immutable configuration of a declared resource.
pub struct ResourceDescriptor {
    pub namespace: String,
    pub identity_field: String,
    pub backend: Arc<dyn Backend>,
    pub populate_children: bool,
    pub policy: FetchPolicy,
    serialize: Option<Hook>,
    deserialize: Option<Hook>,
}

impl ResourceDescriptor {
    /// Cache key (and URL) of one member.
    pub fn entity_key(&self, id: &Identity) -> String {
        CacheKeyBuilder::entity(&self.namespace, id)
    }

    /// Cache key (and URL) of the collection.
    pub fn collection_key(&self) -> String {
        CacheKeyBuilder::collection(&self.namespace)
    }

    pub fn identify(&self, record: &Record) -> Option<Identity> {
        Identity::from_record(record, &self.identity_field)
    }

    /// Outgoing body for entity fields. Passthrough without a hook.
    pub fn serialize(&self, fields: &Record) -> Record {
        match &self.serialize {
            Some(hook) => hook(fields),
            None => fields.clone(),
        }
    }

    /// Entity fields for a raw response record. Passthrough without a hook.
    pub fn deserialize(&self, raw: Record) -> Record {
        match &self.deserialize {
            Some(hook) => hook(&raw),
            None => raw,
        }
    }

    pub fn identity_missing(&self) -> Error {
        Error::IdentityMissing {
            namespace: self.namespace.clone(),
            field: self.identity_field.clone(),
        }
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("namespace", &self.namespace)
            .field("identity_field", &self.identity_field)
            .field("populate_children", &self.populate_children)
            .field("policy", &self.policy)
            .field("serialize", &self.serialize.is_some())
            .field("deserialize", &self.deserialize.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn test_resolve_uses_fallbacks() {
        let descriptor = ResourceOptions::new("/api/people/")
            .with_backend(MockBackend::new())
            .resolve(&Defaults::default())
            .expect("Failed to resolve");

        assert_eq!(descriptor.namespace, "/api/people");
        assert_eq!(descriptor.identity_field, "id");
        assert!(descriptor.populate_children);
        assert_eq!(descriptor.policy, FetchPolicy::Revalidate);
        assert_eq!(descriptor.entity_key(&Identity::from(5)), "/api/people/5");
    }

    #[test]
    fn test_resolve_prefers_options_over_defaults() {
        let defaults = Defaults::new()
            .with_backend(MockBackend::new())
            .with_identity_field("uuid")
            .with_populate_children(false);

        let descriptor = ResourceOptions::new("/api/objects")
            .with_identity_field("key")
            .resolve(&defaults)
            .expect("Failed to resolve");

        assert_eq!(descriptor.identity_field, "key");
        assert!(!descriptor.populate_children);
    }

    #[test]
    fn test_resolve_rejects_missing_namespace_and_backend() {
        let err = ResourceOptions::new("  ")
            .with_backend(MockBackend::new())
            .resolve(&Defaults::default())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));

        let err = ResourceOptions::new("/api/people")
            .resolve(&Defaults::default())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_hooks_default_to_passthrough() {
        let plain = ResourceOptions::new("/api/documents")
            .with_backend(MockBackend::new())
            .resolve(&Defaults::default())
            .expect("Failed to resolve");
        let raw = record(json!({"body": "bogus"}));
        assert_eq!(plain.serialize(&raw), raw);
        assert_eq!(plain.deserialize(raw.clone()), raw);

        let hooked = ResourceOptions::new("/api/documents")
            .with_backend(MockBackend::new())
            .with_serialize(|_| record(json!({"body": "bogus"})))
            .with_deserialize(|raw| {
                let mut fields = raw.clone();
                if let Some(Value::String(body)) = raw.get("body") {
                    fields.insert("body".to_string(), json!(body.to_uppercase()));
                }
                fields
            })
            .resolve(&Defaults::default())
            .expect("Failed to resolve");

        assert_eq!(
            hooked.serialize(&record(json!({"id": 2}))),
            record(json!({"body": "bogus"}))
        );
        assert_eq!(hooked.deserialize(raw), record(json!({"body": "BOGUS"})));
    }
}
