//! The operation surface of a declared resource.
//!
//! A [`Resource<T>`] pairs an immutable [`ResourceDescriptor`] with the shared
//! cache and exposes fetch, create, update and delete. `T` is the typed shape
//! of one entity; it only matters at the API edge (`create(&T)`,
//! `update(&T, ..)`, `get_model`), the cache itself stores field records.
//!
//! All operations start eagerly: the backend call is made before the method
//! returns and, inside a tokio runtime, the completion is spawned so the
//! cache is updated even if the returned future is dropped.
//!
//! ```ignore
//! let people = registry.declare::<Person>(ResourceOptions::new("/api/people"))?;
//!
//! let scope = View::new();
//! let list = people.get_all().bind(&scope, "people").await?;
//!
//! people.delete(&list.get(1).unwrap()).await?;
//! assert_eq!(scope.collection("people").unwrap().len(), 1);
//! ```

use crate::backend::Method;
use crate::cache::{Inflight, ResourceCache};
use crate::cascade::CascadeEngine;
use crate::coordinator::{Issued, RequestCoordinator};
use crate::descriptor::ResourceDescriptor;
use crate::entity::{to_record, CachedValue, Collection, Entity, Identity, Record};
use crate::error::{Error, Result};
use crate::merge::{merge_entity, select_fields};
use crate::strategy::FetchPolicy;
use crate::view::{View, ViewBinder};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// A declared resource type.
pub struct Resource<T> {
    descriptor: Arc<ResourceDescriptor>,
    coordinator: RequestCoordinator,
    _model: PhantomData<fn() -> T>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Resource {
            descriptor: Arc::clone(&self.descriptor),
            coordinator: self.coordinator.clone(),
            _model: PhantomData,
        }
    }
}

impl<T> Resource<T> {
    pub(crate) fn new(descriptor: ResourceDescriptor, cache: ResourceCache) -> Self {
        cache.register(&descriptor.namespace, &descriptor.identity_field);
        Resource {
            descriptor: Arc::new(descriptor),
            coordinator: RequestCoordinator::new(cache),
            _model: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn namespace(&self) -> &str {
        &self.descriptor.namespace
    }

    pub fn cache(&self) -> &ResourceCache {
        self.coordinator.cache()
    }

    // ------------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------------

    /// Fetch one entity with the resource's default policy.
    pub fn get(&self, id: impl Into<Identity>) -> Fetch<Entity> {
        self.get_with(id, self.descriptor.policy)
    }

    pub fn get_with(&self, id: impl Into<Identity>, policy: FetchPolicy) -> Fetch<Entity> {
        let issued = self.coordinator.fetch_one(&self.descriptor, &id.into(), policy);
        Fetch::from_issued(self.cache().clone(), issued)
    }

    /// Fetch the whole collection with the resource's default policy.
    pub fn get_all(&self) -> Fetch<Collection> {
        self.get_all_with(self.descriptor.policy)
    }

    pub fn get_all_with(&self, policy: FetchPolicy) -> Fetch<Collection> {
        let issued = self.coordinator.fetch_all(&self.descriptor, policy);
        Fetch::from_issued(self.cache().clone(), issued)
    }

    /// Owned instance cached for `id`, without any request.
    pub fn cached(&self, id: impl Into<Identity>) -> Option<Entity> {
        let key = self.descriptor.entity_key(&id.into());
        self.cache()
            .value(&key)
            .and_then(|v| v.as_entity().cloned())
            .or_else(|| self.cache().owned(&key))
    }

    /// Cached collection, without any request.
    pub fn cached_all(&self) -> Option<Collection> {
        self.cache()
            .value(&self.descriptor.collection_key())
            .and_then(|v| v.as_collection().cloned())
    }

    /// Seed the cache with a locally built entity carrying an identity.
    ///
    /// # Errors
    ///
    /// Returns `Error::IdentityMissing` if `entity` has no identity.
    pub fn prefill(&self, entity: &Entity) -> Result<Entity> {
        let id = entity
            .identity(&self.descriptor.identity_field)
            .ok_or_else(|| self.descriptor.identity_missing())?;
        Ok(self
            .cache()
            .prefill(&self.descriptor.entity_key(&id), entity.clone()))
    }

    // ------------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------------

    /// `POST namespace` with the given fields.
    pub fn create_record(&self, fields: Record) -> BoxFuture<'static, Result<Entity>> {
        self.create_entity(&Entity::from_record(fields))
    }

    /// `POST namespace` with the serialized entity.
    ///
    /// The response is merged into `entity`, which then becomes the owned
    /// instance for its new identity and is appended to the cached
    /// collection.
    pub fn create_entity(&self, entity: &Entity) -> BoxFuture<'static, Result<Entity>> {
        let descriptor = Arc::clone(&self.descriptor);
        let cache = self.cache().clone();
        let entity = entity.clone();
        let url = descriptor.collection_key();
        let body = Value::Object(descriptor.serialize(&entity.snapshot()));
        let epoch = cache.epoch();

        let call = descriptor.backend.call(Method::Post, &url, Some(body));
        let started = Instant::now();
        debug!("» POST {}", url);

        drive(async move {
            let response = finish(&cache, Method::Post, &url, started, call.await)?;
            if let Some(raw) = response_fields(&descriptor, response) {
                merge_entity(&entity, raw);
            }
            if cache.epoch() != epoch {
                debug!("✗ POST {} outlived a cache clear, result detached", url);
                return Ok(entity);
            }

            let owned = CascadeEngine::new(&cache).created(&descriptor, entity);
            info!(
                "✓ CREATE {} -> {}",
                url,
                owned
                    .identity(&descriptor.identity_field)
                    .map(|id| id.to_string())
                    .unwrap_or_default()
            );
            Ok(owned)
        })
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// `PUT namespace/id` for a payload carrying its identity.
    ///
    /// With `fields`, only the allow-listed fields are sent and merged
    /// locally. The payload's identity is always kept locally so the result
    /// lands on the right owned instance.
    ///
    /// # Errors
    ///
    /// Resolves to `Error::IdentityMissing` without a request when the payload
    /// has no identity.
    pub fn update_record(
        &self,
        payload: Record,
        fields: Option<&[&str]>,
    ) -> BoxFuture<'static, Result<Entity>> {
        let descriptor = Arc::clone(&self.descriptor);
        let Some(id) = descriptor.identify(&payload) else {
            return future::ready(Err(descriptor.identity_missing())).boxed();
        };

        let cache = self.cache().clone();
        let url = descriptor.entity_key(&id);
        let outgoing = select_fields(&descriptor.serialize(&payload), fields);
        let mut local = select_fields(&payload, fields);
        if let Some(value) = payload.get(&descriptor.identity_field) {
            local.insert(descriptor.identity_field.clone(), value.clone());
        }
        let epoch = cache.epoch();

        let call = descriptor
            .backend
            .call(Method::Put, &url, Some(Value::Object(outgoing)));
        let started = Instant::now();
        debug!("» PUT {}", url);

        drive(async move {
            let response = finish(&cache, Method::Put, &url, started, call.await)?;
            let subject = Entity::from_record(local);
            if let Some(raw) = response_fields(&descriptor, response) {
                merge_entity(&subject, raw);
            }
            if cache.epoch() != epoch {
                debug!("✗ PUT {} outlived a cache clear, result detached", url);
                return Ok(subject);
            }

            let owned = CascadeEngine::new(&cache).updated(&descriptor, &id, subject);
            info!("✓ UPDATE {}", url);
            Ok(owned)
        })
    }

    /// `PUT namespace/id` with the serialized entity, merging the response
    /// back into it.
    ///
    /// # Errors
    ///
    /// Resolves to `Error::IdentityMissing` without a request when the entity
    /// has no identity.
    pub fn update_entity(&self, entity: &Entity) -> BoxFuture<'static, Result<Entity>> {
        let descriptor = Arc::clone(&self.descriptor);
        let Some(id) = entity.identity(&descriptor.identity_field) else {
            return future::ready(Err(descriptor.identity_missing())).boxed();
        };

        let cache = self.cache().clone();
        let entity = entity.clone();
        let url = descriptor.entity_key(&id);
        let body = Value::Object(descriptor.serialize(&entity.snapshot()));
        let epoch = cache.epoch();

        let call = descriptor.backend.call(Method::Put, &url, Some(body));
        let started = Instant::now();
        debug!("» PUT {}", url);

        drive(async move {
            let response = finish(&cache, Method::Put, &url, started, call.await)?;
            if let Some(raw) = response_fields(&descriptor, response) {
                merge_entity(&entity, raw);
            }
            if cache.epoch() != epoch {
                debug!("✗ PUT {} outlived a cache clear, result detached", url);
                return Ok(entity);
            }

            let owned = CascadeEngine::new(&cache).updated(&descriptor, &id, entity);
            info!("✓ UPDATE {}", url);
            Ok(owned)
        })
    }

    // ------------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------------

    /// `DELETE namespace/id` for an identity, a payload or an entity.
    ///
    /// On success the single-item entry is dropped and the identity removed
    /// from every cached collection of the namespace.
    ///
    /// # Errors
    ///
    /// Resolves to `Error::IdentityMissing` without a request when no identity
    /// can be derived from `target`.
    pub fn delete(&self, target: impl Into<Target>) -> BoxFuture<'static, Result<()>> {
        let descriptor = Arc::clone(&self.descriptor);
        let target: Target = target.into();
        let id = match target {
            Target::Id(id) => Some(id),
            Target::Payload(payload) => descriptor.identify(&payload),
            Target::Entity(entity) => entity.identity(&descriptor.identity_field),
        };
        let Some(id) = id else {
            return future::ready(Err(descriptor.identity_missing())).boxed();
        };

        let cache = self.cache().clone();
        let url = descriptor.entity_key(&id);
        let epoch = cache.epoch();

        let call = descriptor.backend.call(Method::Delete, &url, None);
        let started = Instant::now();
        debug!("» DELETE {}", url);

        drive(async move {
            finish(&cache, Method::Delete, &url, started, call.await)?;
            if cache.epoch() != epoch {
                debug!("✗ DELETE {} outlived a cache clear, nothing to cascade", url);
                return Ok(());
            }

            let touched = CascadeEngine::new(&cache).deleted(&descriptor, &id);
            info!("✓ DELETE {} ({} entries touched)", url, touched);
            Ok(())
        })
    }
}

impl<T: Serialize> Resource<T> {
    /// `POST namespace` with a typed payload.
    pub fn create(&self, model: &T) -> BoxFuture<'static, Result<Entity>> {
        match to_record(model) {
            Ok(fields) => self.create_record(fields),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    /// `PUT namespace/id` with a typed payload, optionally restricted to
    /// `fields`.
    pub fn update(&self, model: &T, fields: Option<&[&str]>) -> BoxFuture<'static, Result<Entity>> {
        match to_record(model) {
            Ok(payload) => self.update_record(payload, fields),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }
}

impl<T: DeserializeOwned> Resource<T> {
    /// Fetch one entity and decode it into `T`.
    pub async fn get_model(&self, id: impl Into<Identity>) -> Result<T> {
        self.get(id).await?.decode()
    }
}

impl<T> std::fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Run a mutation on the current runtime, or lazily without one.
fn drive<R, F>(work: F) -> BoxFuture<'static, Result<R>>
where
    R: Send + 'static,
    F: Future<Output = Result<R>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(work);
            async move {
                task.await
                    .map_err(|e| Error::Other(format!("mutation task failed: {}", e)))?
            }
            .boxed()
        }
        Err(_) => work.boxed(),
    }
}

fn finish(
    cache: &ResourceCache,
    method: Method,
    url: &str,
    started: Instant,
    outcome: Result<Option<Value>>,
) -> Result<Option<Value>> {
    cache.metrics().record_request(method, url, started.elapsed());
    outcome.map_err(|e| {
        cache.metrics().record_error(url, &e.to_string());
        warn!("✗ {} {} failed: {}", method, url, e);
        e
    })
}

/// Entity fields carried by a mutation response, if any.
fn response_fields(descriptor: &ResourceDescriptor, body: Option<Value>) -> Option<Record> {
    match body {
        Some(Value::Object(raw)) => Some(descriptor.deserialize(raw)),
        Some(Value::Null) | None => None,
        Some(other) => {
            debug!("⚠ ignoring non-object response from {}: {}", descriptor.namespace, other);
            None
        }
    }
}

// ============================================================================
// Delete targets
// ============================================================================

/// What a delete names: an identity, a payload carrying one, or an entity.
#[derive(Clone, Debug)]
pub enum Target {
    Id(Identity),
    Payload(Record),
    Entity(Entity),
}

impl From<Identity> for Target {
    fn from(id: Identity) -> Self {
        Target::Id(id)
    }
}

macro_rules! target_from_id {
    ($($t:ty),*) => {
        $(impl From<$t> for Target {
            fn from(id: $t) -> Self {
                Target::Id(Identity::from(id))
            }
        })*
    };
}

target_from_id!(i32, i64, u32, u64, usize, &str, String);

impl From<Record> for Target {
    fn from(payload: Record) -> Self {
        Target::Payload(payload)
    }
}

impl From<Entity> for Target {
    fn from(entity: Entity) -> Self {
        Target::Entity(entity)
    }
}

impl From<&Entity> for Target {
    fn from(entity: &Entity) -> Self {
        Target::Entity(entity.clone())
    }
}

impl From<Value> for Target {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(payload) => Target::Payload(payload),
            other => match Identity::from_value(&other) {
                Some(id) => Target::Id(id),
                None => Target::Payload(Record::new()),
            },
        }
    }
}

// ============================================================================
// Fetch handle
// ============================================================================

/// Handle to an issued fetch.
///
/// Holds the value cached when the fetch was issued and the shared request.
/// Awaiting it resolves to the owned instance once the request completes.
pub struct Fetch<V> {
    key: String,
    cache: ResourceCache,
    cached: Option<V>,
    inflight: Option<Inflight>,
}

impl<V: CachedValue> Fetch<V> {
    fn from_issued(cache: ResourceCache, issued: Issued) -> Self {
        Fetch {
            key: issued.key,
            cache,
            cached: issued.cached.and_then(|value| V::from_cached(value).ok()),
            inflight: issued.inflight,
        }
    }

    /// Cache key (and URL) of the fetch.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value that was cached when the fetch was issued.
    pub fn cached(&self) -> Option<&V> {
        self.cached.as_ref()
    }

    /// Whether a backend request backs this fetch.
    pub fn is_pending(&self) -> bool {
        self.inflight.is_some()
    }

    /// Bind the fetched entry into `view[field]`.
    ///
    /// Sets the field right away when the cache has a value, otherwise when
    /// the request completes. Returns the same fetch for chaining.
    pub fn bind(self, view: &View, field: &str) -> Self {
        ViewBinder::bind(&self.cache, view, field, &self.key);
        self
    }
}

impl<V: CachedValue> IntoFuture for Fetch<V> {
    type Output = Result<V>;
    type IntoFuture = BoxFuture<'static, Result<V>>;

    fn into_future(self) -> Self::IntoFuture {
        match self.inflight {
            Some(inflight) => async move { inflight.await.and_then(V::from_cached) }.boxed(),
            None => future::ready(self.cached.ok_or_else(|| {
                Error::Other(format!("no cached {} for {}", V::SHAPE, self.key))
            }))
            .boxed(),
        }
    }
}

impl<V> std::fmt::Debug for Fetch<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetch")
            .field("key", &self.key)
            .field("cached", &self.cached.is_some())
            .field("pending", &self.inflight.is_some())
            .finish()
    }
}
