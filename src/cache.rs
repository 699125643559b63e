//! Key → value store owning the canonical entity and collection instances.
//!
//! The cache keeps three maps:
//!
//! - **entries**: one [`CacheEntry`] per request key (`/api/people`,
//!   `/api/people/123`) with its state, in-flight request and waiting views.
//! - **owned**: the identity map, one [`Entity`] per `namespace/id`. Every
//!   entry, collection member and view that holds an identified entity holds
//!   this instance.
//! - **collections**: one [`Collection`] handle per collection key, created
//!   on first store and dropped only by [`ResourceCache::clear`].
//!
//! Values are never replaced once stored. `put` merges into what is already
//! there, and eviction only drops the entry, not the owned instance or the
//! collection handle, so a later fetch merges back into the handles
//! consumers still hold.

use crate::descriptor::DEFAULT_IDENTITY_FIELD;
use crate::entity::{Cached, Collection, Entity};
use crate::error::Result;
use crate::key::CacheKeyBuilder;
use crate::merge::merge_entity;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::view::WeakView;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The single shared request for one key; every waiter polls a clone.
pub type Inflight = Shared<BoxFuture<'static, Result<Cached>>>;

/// Lifecycle state of a cache entry.
///
/// Transitions: `Empty → Pending → Fresh` and `Fresh → Pending → Fresh`.
/// A failed request reverts `Pending` to the state it came from; only
/// eviction brings an entry back to `Empty`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EntryState {
    #[default]
    Empty,
    Pending,
    Fresh,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Empty => write!(f, "Empty"),
            EntryState::Pending => write!(f, "Pending"),
            EntryState::Fresh => write!(f, "Fresh"),
        }
    }
}

/// Snapshot of one cache entry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    pub value: Option<Cached>,
    pub state: EntryState,
    pub in_flight: bool,
}

impl CacheEntry {
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }
}

/// A view field waiting for an entry's first value.
struct Binding {
    view: WeakView,
    field: String,
}

pub(crate) struct Slot {
    pub(crate) value: Option<Cached>,
    pub(crate) state: EntryState,
    pub(crate) prior: EntryState,
    pub(crate) request: u64,
    pub(crate) inflight: Option<Inflight>,
    bindings: Vec<Binding>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            value: None,
            state: EntryState::Empty,
            prior: EntryState::Empty,
            request: 0,
            inflight: None,
            bindings: Vec::new(),
        }
    }

    /// Store the entry's first value and hand it to every waiting view.
    ///
    /// An entry that already has a value keeps it; the existing value is
    /// returned.
    pub(crate) fn populate(&mut self, value: Cached) -> Cached {
        if let Some(existing) = &self.value {
            return existing.clone();
        }

        for binding in self.bindings.drain(..) {
            if let Some(view) = binding.view.upgrade() {
                view.set(&binding.field, value.clone());
            }
        }
        self.value = Some(value.clone());
        value
    }

    fn attach(&mut self, view: WeakView, field: &str) -> Option<Cached> {
        if let Some(value) = &self.value {
            return Some(value.clone());
        }

        self.bindings.retain(|b| b.view.is_alive());
        if !self
            .bindings
            .iter()
            .any(|b| b.field == field && b.view.same_view(&view))
        {
            self.bindings.push(Binding {
                view,
                field: field.to_string(),
            });
        }
        None
    }
}

struct CacheInner {
    slots: DashMap<String, Slot>,
    owned: DashMap<String, Entity>,
    collections: DashMap<String, Collection>,
    identity_fields: DashMap<String, String>,
    epoch: AtomicU64,
    requests: AtomicU64,
    metrics: Box<dyn CacheMetrics>,
}

/// Process-wide entity cache.
///
/// `Clone` is cheap (an `Arc` increment); clones share the same store.
///
/// # Example
///
/// ```
/// use entity_sync::cache::{ResourceCache, EntryState};
/// use entity_sync::entity::Entity;
///
/// let cache = ResourceCache::new();
///
/// let joe = Entity::new();
/// joe.set("id", 123);
/// joe.set("first_name", "Joe");
///
/// let owned = cache.prefill("/api/people/123", joe.clone());
/// assert!(owned.ptr_eq(&joe));
/// assert_eq!(cache.state("/api/people/123"), EntryState::Fresh);
/// ```
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::with_metrics(Box::new(NoOpMetrics))
    }

    /// Create a cache reporting to custom metrics.
    pub fn with_metrics(metrics: Box<dyn CacheMetrics>) -> Self {
        ResourceCache {
            inner: Arc::new(CacheInner {
                slots: DashMap::new(),
                owned: DashMap::new(),
                collections: DashMap::new(),
                identity_fields: DashMap::new(),
                epoch: AtomicU64::new(0),
                requests: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    /// Snapshot of the entry for `key`.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.slots.get(key).map(|slot| CacheEntry {
            key: key.to_string(),
            value: slot.value.clone(),
            state: slot.state,
            in_flight: slot.inflight.is_some(),
        })
    }

    /// Value stored for `key`, if any.
    pub fn value(&self, key: &str) -> Option<Cached> {
        self.inner.slots.get(key).and_then(|slot| slot.value.clone())
    }

    pub fn state(&self, key: &str) -> EntryState {
        self.inner
            .slots
            .get(key)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Owned instance for an entity key, whether or not an entry exists.
    pub fn owned(&self, key: &str) -> Option<Entity> {
        self.inner.owned.get(key).map(|e| e.value().clone())
    }

    /// Store `value` under `key`, merging into what is already there.
    ///
    /// - An entity is merged into the owned instance for `key` when one
    ///   exists, otherwise it becomes the owned instance.
    /// - A collection replaces the membership of the key's collection handle
    ///   in place; the first collection stored under a key stays its handle.
    ///   Identified members are resolved through the identity map, so the
    ///   collection holds the owned instances.
    ///
    /// Returns the value actually held by the cache.
    pub fn put(&self, key: &str, value: Cached) -> Cached {
        match value {
            Cached::Entity(entity) => Cached::Entity(self.adopt(key, entity)),
            Cached::Collection(collection) => {
                let field = self.identity_field(key);
                let members: Vec<Entity> = collection
                    .to_vec()
                    .into_iter()
                    .map(|member| match member.identity(&field) {
                        Some(id) => self.resolve(&CacheKeyBuilder::entity(key, &id), member),
                        None => member,
                    })
                    .collect();

                let held = self
                    .inner
                    .collections
                    .entry(key.to_string())
                    .or_insert_with(|| collection.clone())
                    .value()
                    .clone();
                *held.write() = members;

                self.with_slot(key, |slot| {
                    if slot.value.as_ref().is_some_and(|v| v.as_entity().is_some()) {
                        warn!("⚠ PUT {} replaces an entity with a collection", key);
                        slot.value = None;
                    }
                    let held = slot.populate(Cached::Collection(held));
                    if slot.state == EntryState::Empty {
                        slot.state = EntryState::Fresh;
                    }
                    debug!("✓ PUT {}", key);
                    held
                })
            }
        }
    }

    /// Seed `key` with an already-constructed entity before any fetch.
    ///
    /// A view bound to `key` afterwards is filled synchronously, and the
    /// next fetch merges into this instance.
    pub fn prefill(&self, key: &str, entity: Entity) -> Entity {
        match self.put(key, Cached::Entity(entity.clone())) {
            Cached::Entity(owned) => owned,
            Cached::Collection(_) => entity,
        }
    }

    /// Drop the entry for `key`, including views still waiting on it.
    ///
    /// The owned instance or collection handle survives; views already
    /// holding it keep their last value and see the next fetch merged in. A request in flight for `key` still resolves, but its
    /// result is no longer written back.
    pub fn evict(&self, key: &str) -> Option<Cached> {
        let evicted = self.inner.slots.remove(key).and_then(|(_, slot)| slot.value);
        debug!("✓ EVICT {}", key);
        evicted
    }

    /// Drop every entry, owned instance and collection handle.
    ///
    /// Requests in flight still resolve for their waiters but are not
    /// written back.
    pub fn clear(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.slots.clear();
        self.inner.owned.clear();
        self.inner.collections.clear();
        warn!("⚠ CLEAR executed - all cached entities dropped!");
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Keys of all entries, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.slots.iter().map(|s| s.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of live views still waiting for `key`'s first value.
    pub fn bindings(&self, key: &str) -> usize {
        self.inner
            .slots
            .get(key)
            .map(|slot| slot.bindings.iter().filter(|b| b.view.is_alive()).count())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Crate-internal plumbing for the coordinator, cascade and view binder
    // ------------------------------------------------------------------------

    pub(crate) fn metrics(&self) -> &dyn CacheMetrics {
        self.inner.metrics.as_ref()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.inner.requests.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Run `f` on the entry for `key`, creating an empty one if needed.
    ///
    /// `f` runs under the entry's shard lock and must not touch the cache.
    pub(crate) fn with_slot<R>(&self, key: &str, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut slot = self.inner.slots.entry(key.to_string()).or_insert_with(Slot::new);
        f(slot.value_mut())
    }

    /// Record the identity field members of `namespace` are keyed by.
    pub(crate) fn register(&self, namespace: &str, identity_field: &str) {
        self.inner.identity_fields.insert(
            CacheKeyBuilder::collection(namespace),
            identity_field.to_string(),
        );
    }

    fn identity_field(&self, namespace: &str) -> String {
        self.inner
            .identity_fields
            .get(namespace)
            .map(|field| field.value().clone())
            .unwrap_or_else(|| DEFAULT_IDENTITY_FIELD.to_string())
    }

    /// Collection handle for `key`, created empty if none exists yet.
    pub(crate) fn collection(&self, key: &str) -> Collection {
        self.inner
            .collections
            .entry(key.to_string())
            .or_insert_with(Collection::new)
            .value()
            .clone()
    }

    /// Whether `request` is still the live request for `key`.
    pub(crate) fn is_current(&self, key: &str, request: u64, epoch: u64) -> bool {
        epoch == self.epoch()
            && self
                .inner
                .slots
                .get(key)
                .is_some_and(|slot| slot.request == request && slot.state == EntryState::Pending)
    }

    /// Finish `request` for `key` successfully.
    pub(crate) fn settle(&self, key: &str, request: u64, value: Cached) -> Cached {
        match self.inner.slots.get_mut(key) {
            Some(mut slot) if slot.request == request => {
                let held = slot.populate(value);
                slot.state = EntryState::Fresh;
                slot.inflight = None;
                held
            }
            _ => value,
        }
    }

    /// Finish `request` for `key` with a failure, restoring the prior state.
    pub(crate) fn fail(&self, key: &str, request: u64) {
        if let Some(mut slot) = self.inner.slots.get_mut(key) {
            if slot.request == request && slot.state == EntryState::Pending {
                slot.state = slot.prior;
                slot.inflight = None;
            }
        }
    }

    /// Owned instance for `key`, created empty if none exists yet.
    pub(crate) fn owned_or_new(&self, key: &str) -> Entity {
        self.inner
            .owned
            .entry(key.to_string())
            .or_insert_with(Entity::new)
            .value()
            .clone()
    }

    /// Register `entity` as owned unless an instance already is.
    pub(crate) fn own(&self, key: &str, entity: &Entity) -> Entity {
        self.inner
            .owned
            .entry(key.to_string())
            .or_insert_with(|| entity.clone())
            .value()
            .clone()
    }

    /// Make `entity` the owned instance for `key` (or merge it into the one
    /// that already is) and make sure the entry holds it.
    pub(crate) fn adopt(&self, key: &str, entity: Entity) -> Entity {
        let owned = self.resolve(key, entity);
        self.seed(key, Cached::Entity(owned.clone()));
        owned
    }

    /// Owned instance for `key` with `entity` merged in, or `entity` itself
    /// when nothing is owned yet.
    fn resolve(&self, key: &str, entity: Entity) -> Entity {
        match self.inner.owned.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let existing = occupied.get().clone();
                drop(occupied);
                if !existing.ptr_eq(&entity) {
                    merge_entity(&existing, entity.snapshot());
                }
                existing
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entity.clone());
                entity
            }
        }
    }

    /// Give an entry its value without disturbing a request in flight.
    pub(crate) fn seed(&self, key: &str, value: Cached) -> Cached {
        self.with_slot(key, |slot| {
            let held = slot.populate(value);
            if slot.state == EntryState::Empty {
                slot.state = EntryState::Fresh;
            }
            held
        })
    }

    /// Drop the owned instance for `key`.
    pub(crate) fn forget(&self, key: &str) -> Option<Entity> {
        self.inner.owned.remove(key).map(|(_, entity)| entity)
    }

    /// Every collection handle belonging to `namespace`, evicted entries
    /// included.
    pub(crate) fn collections(&self, namespace: &str) -> Vec<Collection> {
        self.inner
            .collections
            .iter()
            .filter(|list| CacheKeyBuilder::belongs_to(list.key(), namespace))
            .map(|list| list.value().clone())
            .collect()
    }

    /// Current value of `key`, or register the view field to receive it.
    pub(crate) fn attach(&self, key: &str, view: WeakView, field: &str) -> Option<Cached> {
        self.with_slot(key, |slot| slot.attach(view, field))
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::View;
    use serde_json::json;

    fn person(id: u64, name: &str) -> Entity {
        let e = Entity::new();
        e.set("id", id);
        e.set("first_name", name);
        e
    }

    #[test]
    fn test_get_returns_same_reference_across_merges() {
        let cache = ResourceCache::new();
        let joe = person(123, "Joe");
        cache.prefill("/api/people/123", joe.clone());

        let before = cache.value("/api/people/123").expect("Missing value");
        cache.put("/api/people/123", Cached::Entity(person(123, "Bob")));
        let after = cache.value("/api/people/123").expect("Missing value");

        assert!(before.ptr_eq(&after));
        assert!(after.as_entity().unwrap().ptr_eq(&joe));
        assert_eq!(joe.get("first_name"), Some(json!("Bob")));
    }

    #[test]
    fn test_put_collection_keeps_handle() {
        let cache = ResourceCache::new();
        let first = Collection::from_entities(vec![person(1, "a")]);
        cache.put("/api/people", Cached::Collection(first.clone()));

        let held = cache.put(
            "/api/people",
            Cached::Collection(Collection::from_entities(vec![person(1, "a"), person(2, "b")])),
        );

        assert!(held.as_collection().unwrap().ptr_eq(&first));
        assert_eq!(first.len(), 2);
        assert_eq!(cache.state("/api/people"), EntryState::Fresh);
    }

    #[test]
    fn test_evict_keeps_owned_instance() {
        let cache = ResourceCache::new();
        let joe = cache.prefill("/api/people/123", person(123, "Joe"));

        assert!(cache.evict("/api/people/123").is_some());
        assert_eq!(cache.state("/api/people/123"), EntryState::Empty);
        assert!(cache.get("/api/people/123").is_none());
        assert!(cache.owned("/api/people/123").unwrap().ptr_eq(&joe));
    }

    #[test]
    fn test_clear_drops_everything_and_bumps_epoch() {
        let cache = ResourceCache::new();
        cache.prefill("/api/people/1", person(1, "a"));
        let epoch = cache.epoch();

        cache.clear();

        assert!(cache.is_empty());
        assert!(cache.owned("/api/people/1").is_none());
        assert_eq!(cache.epoch(), epoch + 1);
    }

    #[test]
    fn test_attach_fills_view_on_first_value() {
        let cache = ResourceCache::new();
        let view = View::new();

        assert!(cache.attach("/api/people/1", view.downgrade(), "person").is_none());
        assert!(cache.attach("/api/people/1", view.downgrade(), "person").is_none());
        assert_eq!(cache.bindings("/api/people/1"), 1);

        let joe = cache.prefill("/api/people/1", person(1, "Joe"));

        assert!(view.entity("person").unwrap().ptr_eq(&joe));
        assert_eq!(cache.bindings("/api/people/1"), 0);
    }

    #[test]
    fn test_dropped_view_is_not_filled() {
        let cache = ResourceCache::new();
        let view = View::new();
        cache.attach("/api/people/1", view.downgrade(), "person");
        drop(view);

        assert_eq!(cache.bindings("/api/people/1"), 0);
        cache.prefill("/api/people/1", person(1, "Joe"));
    }

    #[test]
    fn test_collections_by_namespace() {
        let cache = ResourceCache::new();
        cache.put("/api/people", Cached::Collection(Collection::new()));
        cache.put("/api/pets", Cached::Collection(Collection::new()));
        cache.prefill("/api/people/1", person(1, "a"));

        assert_eq!(cache.collections("/api/people").len(), 1);
        assert_eq!(cache.keys(), vec!["/api/people", "/api/people/1", "/api/pets"]);
    }

    #[test]
    fn test_evicted_collection_keeps_its_handle() {
        let cache = ResourceCache::new();
        let list = Collection::from_entities(vec![person(1, "a")]);
        cache.put("/api/people", Cached::Collection(list.clone()));

        cache.evict("/api/people");

        assert!(cache.get("/api/people").is_none());
        assert!(cache.collection("/api/people").ptr_eq(&list));
        assert_eq!(cache.collections("/api/people").len(), 1);

        cache.clear();
        assert!(!cache.collection("/api/people").ptr_eq(&list));
    }

    #[test]
    fn test_put_collection_resolves_owned_members() {
        let cache = ResourceCache::new();
        let owned = cache.prefill("/api/people/1", person(1, "Ruben"));

        let copy = person(1, "Ruben");
        let list = Collection::from_entities(vec![copy.clone(), person(2, "Joe")]);
        cache.put("/api/people", Cached::Collection(list.clone()));

        assert!(list.get(0).unwrap().ptr_eq(&owned));
        assert!(!list.get(0).unwrap().ptr_eq(&copy));
        assert!(list.get(1).unwrap().ptr_eq(&cache.owned("/api/people/2").unwrap()));

        owned.set("first_name", "Bart");
        assert_eq!(list.get(0).unwrap().get("first_name"), Some(json!("Bart")));
    }

    #[test]
    fn test_put_collection_uses_registered_identity_field() {
        let cache = ResourceCache::new();
        cache.register("/api/pets", "slug");
        let rex = Entity::new();
        rex.set("slug", "rex");
        let owned = cache.prefill("/api/pets/rex", rex);

        let copy = Entity::new();
        copy.set("slug", "rex");
        copy.set("age", 3);
        let list = Collection::from_entities(vec![copy]);
        cache.put("/api/pets", Cached::Collection(list.clone()));

        assert!(list.get(0).unwrap().ptr_eq(&owned));
        assert_eq!(owned.get("age"), Some(json!(3)));
    }

    #[test]
    fn test_fail_restores_prior_state() {
        let cache = ResourceCache::new();
        cache.prefill("/api/people/1", person(1, "a"));
        let request = cache.next_request_id();
        cache.with_slot("/api/people/1", |slot| {
            slot.prior = slot.state;
            slot.state = EntryState::Pending;
            slot.request = request;
        });

        assert!(cache.is_current("/api/people/1", request, cache.epoch()));
        cache.fail("/api/people/1", request);
        assert_eq!(cache.state("/api/people/1"), EntryState::Fresh);
    }
}
