//! Cache key derivation.
//!
//! A collection is cached under its namespace (`/api/people`); a single
//! entity under `namespace + "/" + identity` (`/api/people/123`). The same
//! strings double as the request URLs handed to the backend.

use crate::entity::Identity;

/// Builder for cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Key (and URL) of a single entity.
    pub fn entity(namespace: &str, id: &Identity) -> String {
        format!("{}/{}", namespace.trim_end_matches('/'), id)
    }

    /// Key (and URL) of a namespace's collection.
    pub fn collection(namespace: &str) -> String {
        namespace.trim_end_matches('/').to_string()
    }

    /// Split an entity key into namespace and identity.
    ///
    /// Returns `None` for keys without an identity segment.
    pub fn parse(key: &str) -> Option<(&str, Identity)> {
        let (namespace, id) = key.rsplit_once('/')?;
        if namespace.is_empty() || id.is_empty() {
            return None;
        }
        Some((namespace, Identity::from(id)))
    }

    /// Whether `key` names the namespace's collection or one of its entities.
    pub fn belongs_to(key: &str, namespace: &str) -> bool {
        let namespace = namespace.trim_end_matches('/');
        match key.strip_prefix(namespace) {
            Some("") => true,
            Some(rest) => rest.starts_with('/') && !rest[1..].contains('/'),
            None => false,
        }
    }
}
