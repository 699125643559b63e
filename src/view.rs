//! Consumer-held containers and their binding to cache entries.
//!
//! A [`View`] is a bag of named fields, each holding a shared
//! [`Entity`](crate::entity::Entity) or [`Collection`](crate::entity::Collection)
//! handle. Binding a field to a cache key sets it once, either immediately
//! from the cache or when the entry receives its first value. After that the
//! field is never reassigned by the cache: merges mutate the handle it holds.
//!
//! The cache only keeps a weak reference to a view, so dropping the view
//! drops its pending bindings.

use crate::cache::ResourceCache;
use crate::entity::{Cached, Collection, Entity};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

type Fields = HashMap<String, Cached>;

/// Mutable container of named fields, shared between clones.
///
/// # Example
///
/// ```
/// use entity_sync::view::View;
/// use entity_sync::entity::{Cached, Entity};
///
/// let scope = View::new();
/// let joe = Entity::new();
/// joe.set("first_name", "Joe");
///
/// scope.set("person", Cached::Entity(joe.clone()));
/// assert!(scope.entity("person").unwrap().ptr_eq(&joe));
/// ```
#[derive(Clone, Default)]
pub struct View {
    inner: Arc<RwLock<Fields>>,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `field`, if set.
    pub fn get(&self, field: &str) -> Option<Cached> {
        self.read().get(field).cloned()
    }

    /// Entity held by `field`, if it holds one.
    pub fn entity(&self, field: &str) -> Option<Entity> {
        self.read().get(field).and_then(Cached::as_entity).cloned()
    }

    /// Collection held by `field`, if it holds one.
    pub fn collection(&self, field: &str) -> Option<Collection> {
        self.read().get(field).and_then(Cached::as_collection).cloned()
    }

    pub fn set(&self, field: &str, value: Cached) {
        self.write().insert(field.to_string(), value);
    }

    pub fn remove(&self, field: &str) -> Option<Cached> {
        self.write().remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.read().contains_key(field)
    }

    /// Names of all set fields, sorted.
    pub fn fields(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn ptr_eq(&self, other: &View) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakView {
        WeakView(Arc::downgrade(&self.inner))
    }

    fn read(&self) -> RwLockReadGuard<'_, Fields> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Fields> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.read().iter()).finish()
    }
}

/// Non-owning reference to a view, held by pending bindings.
#[derive(Clone)]
pub(crate) struct WeakView(Weak<RwLock<Fields>>);

impl WeakView {
    pub(crate) fn upgrade(&self) -> Option<View> {
        self.0.upgrade().map(|inner| View { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub(crate) fn same_view(&self, other: &WeakView) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

/// Attaches cache entries to view fields.
pub struct ViewBinder;

impl ViewBinder {
    /// Bind `view[field]` to the cache entry for `key`.
    ///
    /// When the entry already holds a value the field is set right away and
    /// `true` is returned. Otherwise the field is left untouched and set once
    /// the entry is first populated.
    pub fn bind(cache: &ResourceCache, view: &View, field: &str, key: &str) -> bool {
        match cache.attach(key, view.downgrade(), field) {
            Some(value) => {
                view.set(field, value);
                debug!("✓ BIND {} -> {} (from cache)", key, field);
                true
            }
            None => {
                debug!("» BIND {} -> {} (waiting)", key, field);
                false
            }
        }
    }
}
