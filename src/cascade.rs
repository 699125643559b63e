//! Propagation of mutations into every cache entry holding the entity.
//!
//! Runs after a create, update or delete has succeeded against the backend.
//! Only entries that exist are touched; a cascade over an empty cache is a
//! no-op, never an error.

use crate::cache::ResourceCache;
use crate::descriptor::ResourceDescriptor;
use crate::entity::{Entity, Identity};
use crate::observability::CascadeKind;

/// Applies create/update/delete outcomes across the cache.
pub struct CascadeEngine<'a> {
    cache: &'a ResourceCache,
}

impl<'a> CascadeEngine<'a> {
    pub fn new(cache: &'a ResourceCache) -> Self {
        CascadeEngine { cache }
    }

    /// A created entity becomes owned and is appended to every cached
    /// collection of its namespace that doesn't hold its identity yet.
    ///
    /// An entity without identity (the backend returned none) is left
    /// uncached.
    pub fn created(&self, descriptor: &ResourceDescriptor, entity: Entity) -> Entity {
        let Some(id) = entity.identity(&descriptor.identity_field) else {
            debug!("⚠ CREATE in {} returned no identity, not cached", descriptor.namespace);
            return entity;
        };

        let key = descriptor.entity_key(&id);
        let owned = self.cache.adopt(&key, entity);

        let mut touched = 1;
        for collection in self.cache.collections(&descriptor.namespace) {
            if collection.position(&id, &descriptor.identity_field).is_none() {
                collection.write().push(owned.clone());
                touched += 1;
            }
        }

        self.cache
            .metrics()
            .record_cascade(CascadeKind::Create, &key, touched);
        owned
    }

    /// Merge `subject` into the owned instance for `id`, adopting it when
    /// nothing is owned yet.
    ///
    /// Collections and views already holding the owned instance see the
    /// change without further work.
    pub fn updated(&self, descriptor: &ResourceDescriptor, id: &Identity, subject: Entity) -> Entity {
        let key = descriptor.entity_key(id);
        let owned = self.cache.adopt(&key, subject);

        let touched = 1 + self
            .cache
            .collections(&descriptor.namespace)
            .iter()
            .filter(|collection| collection.contains(&owned))
            .count();

        self.cache
            .metrics()
            .record_cascade(CascadeKind::Update, &key, touched);
        owned
    }

    /// Drop the single-item entry for `id` and remove the identity from
    /// every cached collection of the namespace, keeping the order of the
    /// remaining members.
    ///
    /// Views bound to the dropped entry keep their last value. Returns the
    /// number of entries touched.
    pub fn deleted(&self, descriptor: &ResourceDescriptor, id: &Identity) -> usize {
        let key = descriptor.entity_key(id);
        let mut touched = usize::from(self.cache.evict(&key).is_some());
        self.cache.forget(&key);

        for collection in self.cache.collections(&descriptor.namespace) {
            let mut members = collection.write();
            let before = members.len();
            members.retain(|member| member.identity(&descriptor.identity_field).as_ref() != Some(id));
            if members.len() != before {
                touched += 1;
            }
        }

        self.cache
            .metrics()
            .record_cascade(CascadeKind::Delete, &key, touched);
        touched
    }
}
