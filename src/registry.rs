//! Registry of declared resources: shared cache plus fallback defaults.
//!
//! One registry is one process-scoped cache. Every resource declared from it
//! shares that cache, so identities are unique across all of them.

use crate::backend::Backend;
use crate::cache::ResourceCache;
use crate::descriptor::ResourceOptions;
use crate::entity::Entity;
use crate::error::Result;
use crate::observability::CacheMetrics;
use crate::resource::Resource;
use crate::strategy::FetchPolicy;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Fallbacks for settings a resource declaration leaves out.
///
/// Resolved at declaration time: changing the defaults later only affects
/// resources declared afterwards.
#[derive(Clone, Default)]
pub struct Defaults {
    pub(crate) backend: Option<Arc<dyn Backend>>,
    pub(crate) identity_field: Option<String>,
    pub(crate) populate_children: Option<bool>,
    pub(crate) policy: Option<FetchPolicy>,
}

impl Defaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend<B: Backend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn with_shared_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = Some(field.into());
        self
    }

    pub fn with_populate_children(mut self, populate: bool) -> Self {
        self.populate_children = Some(populate);
        self
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }
}

impl fmt::Debug for Defaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defaults")
            .field("backend", &self.backend.is_some())
            .field("identity_field", &self.identity_field)
            .field("populate_children", &self.populate_children)
            .field("policy", &self.policy)
            .finish()
    }
}

struct RegistryInner {
    defaults: RwLock<Defaults>,
    cache: ResourceCache,
}

/// Shared registry state.
///
/// `Clone` is cheap; clones share defaults and cache.
///
/// # Example
///
/// ```ignore
/// use entity_sync::{Defaults, Registry, ResourceOptions};
///
/// let registry = Registry::init(Defaults::new().with_backend(http_backend));
/// let people = registry.declare::<Person>(ResourceOptions::new("/api/people"))?;
/// let pets = registry.declare::<Pet>(ResourceOptions::new("/api/pets"))?;
///
/// // Tear down between tests
/// registry.reset();
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Registry with empty defaults.
    pub fn new() -> Self {
        Self::init(Defaults::default())
    }

    /// Registry with the given defaults.
    pub fn init(defaults: Defaults) -> Self {
        Self::from_parts(defaults, ResourceCache::new())
    }

    /// Registry whose cache reports to custom metrics.
    pub fn with_metrics(defaults: Defaults, metrics: Box<dyn CacheMetrics>) -> Self {
        Self::from_parts(defaults, ResourceCache::with_metrics(metrics))
    }

    fn from_parts(defaults: Defaults, cache: ResourceCache) -> Self {
        Registry {
            inner: Arc::new(RegistryInner {
                defaults: RwLock::new(defaults),
                cache,
            }),
        }
    }

    /// Replace the defaults for resources declared from now on.
    pub fn set_defaults(&self, defaults: Defaults) {
        *self
            .inner
            .defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner) = defaults;
    }

    pub fn defaults(&self) -> Defaults {
        self.inner
            .defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the defaults and everything cached.
    pub fn reset(&self) {
        self.set_defaults(Defaults::default());
        self.inner.cache.clear();
        info!("✓ Registry reset");
    }

    /// Drop everything cached, keeping the defaults.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    /// Seed `key` with a locally built entity before any fetch.
    pub fn cache(&self, key: &str, entity: Entity) -> Entity {
        self.inner.cache.prefill(key, entity)
    }

    /// The shared cache.
    pub fn cache_handle(&self) -> &ResourceCache {
        &self.inner.cache
    }

    /// Declare a resource type.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` when the namespace is empty or no backend
    /// is available from the options or the defaults.
    pub fn declare<T>(&self, options: ResourceOptions) -> Result<Resource<T>> {
        let descriptor = options.resolve(&self.defaults())?;
        info!(
            "✓ Declared resource {} (identity: {}, populate children: {})",
            descriptor.namespace, descriptor.identity_field, descriptor.populate_children
        );
        Ok(Resource::new(descriptor, self.inner.cache.clone()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
