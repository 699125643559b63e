//! Request deduplication and response normalization.
//!
//! Every fetch goes through one internal `request` step, which decides,
//! under the entry's lock, between three outcomes:
//!
//! - **join**: the entry is `Pending`; the caller gets a clone of the shared
//!   in-flight future and no backend call is made.
//! - **hit**: the policy is `CacheFirst` and the entry is `Fresh`; the cached
//!   value is returned and nothing is issued.
//! - **issue**: one backend call is made and its completion stored as the
//!   entry's in-flight future.
//!
//! Completions merge into the cache's owned instances. A completion whose
//! entry was evicted or cleared meanwhile resolves to a detached value that
//! is never written back.

use crate::backend::Method;
use crate::cache::{EntryState, Inflight, ResourceCache};
use crate::descriptor::ResourceDescriptor;
use crate::entity::{Cached, Collection, Entity, Identity, Record};
use crate::error::{Error, Result};
use crate::merge::{merge_collection, merge_entity};
use crate::strategy::FetchPolicy;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of issuing a fetch.
pub struct Issued {
    pub key: String,
    /// Value cached at the moment the fetch was issued.
    pub cached: Option<Cached>,
    /// Shared request the caller can wait on. `None` on a `CacheFirst` hit.
    pub inflight: Option<Inflight>,
}

/// Issues fetches against the cache, one in-flight request per key.
#[derive(Clone)]
pub struct RequestCoordinator {
    cache: ResourceCache,
}

impl RequestCoordinator {
    pub fn new(cache: ResourceCache) -> Self {
        RequestCoordinator { cache }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Fetch a single entity (`GET namespace/id`).
    pub fn fetch_one(
        &self,
        descriptor: &Arc<ResourceDescriptor>,
        id: &Identity,
        policy: FetchPolicy,
    ) -> Issued {
        let key = descriptor.entity_key(id);
        let descriptor = Arc::clone(descriptor);
        let cache = self.cache.clone();

        self.request(&key, policy, move |key, request, epoch| {
            let call = descriptor.backend.call(Method::Get, &key, None);
            let started = Instant::now();
            async move {
                let outcome = call.await;
                cache
                    .metrics()
                    .record_request(Method::Get, &key, started.elapsed());

                match outcome.and_then(|body| normalize_one(&descriptor, body)) {
                    Ok(fields) => Ok(apply_one(&cache, &key, request, epoch, fields)),
                    Err(e) => Err(abort(&cache, &key, request, e)),
                }
            }
            .boxed()
        })
    }

    /// Fetch the namespace's collection (`GET namespace`).
    pub fn fetch_all(&self, descriptor: &Arc<ResourceDescriptor>, policy: FetchPolicy) -> Issued {
        let key = descriptor.collection_key();
        let descriptor = Arc::clone(descriptor);
        let cache = self.cache.clone();

        self.request(&key, policy, move |key, request, epoch| {
            let call = descriptor.backend.call(Method::Get, &key, None);
            let started = Instant::now();
            async move {
                let outcome = call.await;
                cache
                    .metrics()
                    .record_request(Method::Get, &key, started.elapsed());

                match outcome.and_then(|body| normalize_all(&descriptor, body)) {
                    Ok(records) => Ok(apply_all(&cache, &descriptor, &key, request, epoch, records)),
                    Err(e) => Err(abort(&cache, &key, request, e)),
                }
            }
            .boxed()
        })
    }

    /// Join, answer from cache, or issue a request for `key`.
    ///
    /// `factory` receives the key, the request id and the cache epoch and
    /// must build the completion future without polling it. It runs under
    /// the entry's lock, so it must not touch the cache synchronously.
    fn request<F>(&self, key: &str, policy: FetchPolicy, factory: F) -> Issued
    where
        F: FnOnce(String, u64, u64) -> BoxFuture<'static, Result<Cached>>,
    {
        if policy == FetchPolicy::Invalidate && self.cache.state(key) != EntryState::Pending {
            self.cache.evict(key);
        }

        let request = self.cache.next_request_id();
        let epoch = self.cache.epoch();
        let mut issued_new = false;

        let (cached, inflight) = self.cache.with_slot(key, |slot| {
            let cached = slot.value.clone();

            if slot.state == EntryState::Pending {
                if let Some(inflight) = &slot.inflight {
                    return (cached, Some(inflight.clone()));
                }
            }

            if policy == FetchPolicy::CacheFirst && slot.state == EntryState::Fresh && cached.is_some() {
                return (cached, None);
            }

            let inflight = factory(key.to_string(), request, epoch).shared();
            slot.prior = slot.state;
            slot.state = EntryState::Pending;
            slot.request = request;
            slot.inflight = Some(inflight.clone());
            issued_new = true;
            (cached, Some(inflight))
        });

        let metrics = self.cache.metrics();
        match (&inflight, issued_new) {
            (Some(inflight), true) => {
                if cached.is_some() {
                    metrics.record_hit(key);
                } else {
                    metrics.record_miss(key);
                }
                debug!("» GET {} ({})", key, policy);
                spawn(inflight);
            }
            (Some(_), false) => {
                metrics.record_dedup(key);
                debug!("» GET {} joined in-flight request", key);
            }
            (None, _) => {
                metrics.record_hit(key);
                debug!("✓ GET {} served from cache", key);
            }
        }

        Issued {
            key: key.to_string(),
            cached,
            inflight,
        }
    }
}

/// Drive a shared request on the current runtime so it completes even if
/// no caller awaits it. Without a runtime it runs when first awaited.
fn spawn(inflight: &Inflight) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let _ = handle.spawn(inflight.clone());
    }
}

fn abort(cache: &ResourceCache, key: &str, request: u64, error: Error) -> Error {
    cache.fail(key, request);
    cache.metrics().record_error(key, &error.to_string());
    warn!("✗ GET {} failed: {}", key, error);
    error
}

fn normalize_one(descriptor: &ResourceDescriptor, body: Option<Value>) -> Result<Record> {
    match body {
        None | Some(Value::Null) => Ok(Record::new()),
        Some(Value::Object(raw)) => Ok(descriptor.deserialize(raw)),
        Some(other) => Err(Error::DeserializationError(format!(
            "expected an object from {}, got {}",
            descriptor.namespace, other
        ))),
    }
}

fn normalize_all(descriptor: &ResourceDescriptor, body: Option<Value>) -> Result<Vec<Record>> {
    match body {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(raw) => Ok(descriptor.deserialize(raw)),
                other => Err(Error::DeserializationError(format!(
                    "expected objects in {} collection, got {}",
                    descriptor.namespace, other
                ))),
            })
            .collect(),
        Some(other) => Err(Error::DeserializationError(format!(
            "expected an array from {}, got {}",
            descriptor.namespace, other
        ))),
    }
}

fn apply_one(cache: &ResourceCache, key: &str, request: u64, epoch: u64, fields: Record) -> Cached {
    if !cache.is_current(key, request, epoch) {
        debug!("✗ GET {} outlived its cache entry, result detached", key);
        return Cached::Entity(Entity::from_record(fields));
    }

    let entity = cache.owned_or_new(key);
    merge_entity(&entity, fields);
    let held = cache.settle(key, request, Cached::Entity(entity));
    debug!("✓ GET {} merged", key);
    held
}

fn apply_all(
    cache: &ResourceCache,
    descriptor: &ResourceDescriptor,
    key: &str,
    request: u64,
    epoch: u64,
    records: Vec<Record>,
) -> Cached {
    if !cache.is_current(key, request, epoch) {
        debug!("✗ GET {} outlived its cache entry, result detached", key);
        let members = records.into_iter().map(Entity::from_record).collect();
        return Cached::Collection(Collection::from_entities(members));
    }

    let collection = cache.collection(key);

    merge_collection(
        &collection,
        records,
        |fields| descriptor.identify(fields),
        |id| match id {
            Some(id) => cache.owned_or_new(&descriptor.entity_key(id)),
            None => Entity::new(),
        },
    );

    let mut seeded = 0;
    for member in collection.to_vec() {
        let Some(id) = member.identity(&descriptor.identity_field) else {
            continue;
        };
        let member_key = descriptor.entity_key(&id);
        cache.own(&member_key, &member);
        if descriptor.populate_children {
            cache.seed(&member_key, Cached::Entity(member));
            seeded += 1;
        }
    }

    let held = cache.settle(key, request, Cached::Collection(collection));
    debug!("✓ GET {} merged, {} member entries seeded", key, seeded);
    held
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::descriptor::ResourceOptions;
    use crate::registry::Defaults;
    use serde_json::json;

    fn people(backend: &MockBackend, populate: bool) -> Arc<ResourceDescriptor> {
        Arc::new(
            ResourceOptions::new("/api/people")
                .with_backend(backend.clone())
                .with_populate_children(populate)
                .resolve(&Defaults::default())
                .expect("Failed to resolve descriptor"),
        )
    }

    async fn settle(issued: Issued) -> Result<Cached> {
        issued.inflight.expect("No request in flight").await
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let backend = MockBackend::new();
        let coordinator = RequestCoordinator::new(ResourceCache::new());
        let descriptor = people(&backend, true);
        let id = Identity::from(123);

        let first = coordinator.fetch_one(&descriptor, &id, FetchPolicy::Revalidate);
        let second = coordinator.fetch_one(&descriptor, &id, FetchPolicy::Revalidate);
        assert_eq!(backend.calls_to(Method::Get, "/api/people/123"), 1);
        assert_eq!(coordinator.cache().state("/api/people/123"), EntryState::Pending);

        backend
            .respond(Method::Get, "/api/people/123", json!({"id": 123, "first_name": "Joe"}))
            .expect("Respond failed");

        let a = settle(first).await.expect("First fetch failed");
        let b = settle(second).await.expect("Second fetch failed");
        assert!(a.ptr_eq(&b));
        assert_eq!(coordinator.cache().state("/api/people/123"), EntryState::Fresh);
    }

    #[tokio::test]
    async fn test_fetch_all_seeds_member_entries() {
        let backend = MockBackend::new();
        backend
            .when(Method::Get, "/api/people")
            .respond(json!([{"id": 1, "first_name": "Ruben"}, {"id": 2, "first_name": "Joe"}]));
        let coordinator = RequestCoordinator::new(ResourceCache::new());
        let descriptor = people(&backend, true);

        let list = settle(coordinator.fetch_all(&descriptor, FetchPolicy::Revalidate))
            .await
            .expect("Fetch failed");
        let list = list.as_collection().unwrap();

        let member = coordinator.cache().value("/api/people/2").expect("Member not seeded");
        assert!(member.as_entity().unwrap().ptr_eq(&list.get(1).unwrap()));
    }

    #[tokio::test]
    async fn test_fetch_all_without_populate_still_shares_instances() {
        let backend = MockBackend::new();
        backend
            .when(Method::Get, "/api/people")
            .respond(json!([{"id": 1, "first_name": "Ruben"}]));
        backend
            .when(Method::Get, "/api/people/1")
            .respond(json!({"id": 1, "first_name": "Bart"}));
        let coordinator = RequestCoordinator::new(ResourceCache::new());
        let descriptor = people(&backend, false);

        let list = settle(coordinator.fetch_all(&descriptor, FetchPolicy::Revalidate))
            .await
            .expect("Fetch failed");
        assert!(coordinator.cache().get("/api/people/1").is_none());

        let one = settle(coordinator.fetch_one(&descriptor, &Identity::from(1), FetchPolicy::Revalidate))
            .await
            .expect("Fetch failed");
        let member = list.as_collection().unwrap().get(0).unwrap();
        assert!(one.as_entity().unwrap().ptr_eq(&member));
        assert_eq!(member.get("first_name"), Some(json!("Bart")));
    }

    #[tokio::test]
    async fn test_cache_first_skips_backend_on_hit() {
        let backend = MockBackend::new();
        let coordinator = RequestCoordinator::new(ResourceCache::new());
        let descriptor = people(&backend, true);
        let joe = Entity::new();
        joe.set("id", 7);
        coordinator.cache().prefill("/api/people/7", joe.clone());

        let issued = coordinator.fetch_one(&descriptor, &Identity::from(7), FetchPolicy::CacheFirst);

        assert!(issued.inflight.is_none());
        assert!(issued.cached.unwrap().as_entity().unwrap().ptr_eq(&joe));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reverts_state_and_reaches_every_waiter() {
        let backend = MockBackend::new();
        let coordinator = RequestCoordinator::new(ResourceCache::new());
        let descriptor = people(&backend, true);
        let joe = Entity::new();
        joe.set("id", 9);
        coordinator.cache().prefill("/api/people/9", joe);

        let first = coordinator.fetch_one(&descriptor, &Identity::from(9), FetchPolicy::Revalidate);
        let second = coordinator.fetch_one(&descriptor, &Identity::from(9), FetchPolicy::Revalidate);
        backend
            .fail(Method::Get, "/api/people/9", "503")
            .expect("Fail failed");

        assert!(settle(first).await.unwrap_err().is_transport());
        assert!(settle(second).await.unwrap_err().is_transport());
        assert_eq!(coordinator.cache().state("/api/people/9"), EntryState::Fresh);
        assert!(coordinator.cache().get("/api/people/9").unwrap().value.is_some());
    }

    #[tokio::test]
    async fn test_malformed_collection_is_rejected() {
        let backend = MockBackend::new();
        backend.when(Method::Get, "/api/people").respond(json!({"id": 1}));
        let coordinator = RequestCoordinator::new(ResourceCache::new());
        let descriptor = people(&backend, true);

        let err = settle(coordinator.fetch_all(&descriptor, FetchPolicy::Revalidate))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeserializationError(_)));
        assert_eq!(coordinator.cache().state("/api/people"), EntryState::Empty);
    }

    #[tokio::test]
    async fn test_result_after_clear_is_detached() {
        let backend = MockBackend::new();
        let coordinator = RequestCoordinator::new(ResourceCache::new());
        let descriptor = people(&backend, true);

        let issued = coordinator.fetch_all(&descriptor, FetchPolicy::Revalidate);
        coordinator.cache().clear();
        backend
            .respond(Method::Get, "/api/people", json!([{"id": 1}]))
            .expect("Respond failed");

        let list = settle(issued).await.expect("Fetch failed");
        assert_eq!(list.as_collection().unwrap().len(), 1);
        assert!(coordinator.cache().is_empty());
    }
}
