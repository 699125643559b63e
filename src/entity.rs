//! Shared entity and collection handles owned by the cache.
//!
//! An [`Entity`] is a mutable record of named JSON fields behind a shared
//! handle. Cloning the handle never copies the record: every clone observes
//! the same fields, which is what lets a merge into the cache's owned instance
//! show up in every collection and view that holds it.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Field record of an entity, as received from or sent to the backend.
pub type Record = serde_json::Map<String, Value>;

/// Identity value of an entity within its namespace.
///
/// Numbers and strings normalize to the same textual form, so `123`, `123.0`
/// and `"123"` name the same entity and produce the same URL segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Extract an identity from a raw JSON value.
    ///
    /// Only non-empty strings and numbers qualify; `null`, booleans, arrays
    /// and objects are not identities.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Identity(s.clone())),
            Value::Number(n) => Some(Identity(integral(n).unwrap_or_else(|| n.to_string()))),
            _ => None,
        }
    }

    /// Read the identity field out of a record.
    pub fn from_record(record: &Record, field: &str) -> Option<Self> {
        record.get(field).and_then(Identity::from_value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Integer form of `n`, including floats without a fractional part.
fn integral(n: &serde_json::Number) -> Option<String> {
    if let Some(i) = n.as_i64() {
        return Some(i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Some(u.to_string());
    }
    let f = n.as_f64()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        return Some((f as i64).to_string());
    }
    None
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! identity_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Identity {
            fn from(id: $t) -> Self {
                Identity(id.to_string())
            }
        })*
    };
}

identity_from_int!(i32, i64, u32, u64, usize);

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Identity(id.to_string())
    }
}

impl From<String> for Identity {
    fn from(id: String) -> Self {
        Identity(id)
    }
}

// ============================================================================
// Entity
// ============================================================================

/// Shared handle to one entity's fields.
///
/// Equality of handles is reference equality ([`Entity::ptr_eq`]); two
/// distinct handles with equal fields are still different instances.
#[derive(Clone, Default)]
pub struct Entity {
    inner: Arc<RwLock<Record>>,
}

impl Entity {
    /// Create an empty, unidentified entity.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: Record) -> Self {
        Entity {
            inner: Arc::new(RwLock::new(record)),
        }
    }

    /// Build an entity from a typed shape that serializes to a JSON object.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if `model` is not an object.
    pub fn from_model<T: Serialize>(model: &T) -> Result<Self> {
        to_record(model).map(Entity::from_record)
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.read().get(field).cloned()
    }

    /// String view of a field, if it holds a string.
    pub fn get_str(&self, field: &str) -> Option<String> {
        self.read()
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        self.write().insert(field.into(), value.into());
    }

    pub fn remove(&self, field: &str) -> Option<Value> {
        self.write().remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.read().contains_key(field)
    }

    /// Identity of this entity under the given identity field.
    pub fn identity(&self, field: &str) -> Option<Identity> {
        Identity::from_record(&self.read(), field)
    }

    /// Copy of the current fields.
    pub fn snapshot(&self) -> Record {
        self.read().clone()
    }

    /// Decode the current fields into a typed shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationError` if the fields don't fit `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.snapshot()))
            .map_err(|e| Error::DeserializationError(e.to_string()))
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Entity").field(&*self.read()).finish()
    }
}

// ============================================================================
// Collection
// ============================================================================

/// Shared handle to an ordered sequence of owned entities.
///
/// The handle is created once per cache entry and never swapped; membership
/// changes happen inside it.
#[derive(Clone, Default)]
pub struct Collection {
    inner: Arc<RwLock<Vec<Entity>>>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: Vec<Entity>) -> Self {
        Collection {
            inner: Arc::new(RwLock::new(entities)),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Handle to the member at `index`.
    pub fn get(&self, index: usize) -> Option<Entity> {
        self.read().get(index).cloned()
    }

    /// Handles to all members, in order.
    pub fn to_vec(&self) -> Vec<Entity> {
        self.read().clone()
    }

    /// Position of the member with the given identity.
    pub fn position(&self, id: &Identity, identity_field: &str) -> Option<usize> {
        self.read()
            .iter()
            .position(|e| e.identity(identity_field).as_ref() == Some(id))
    }

    /// Whether this exact instance is a member.
    pub fn contains(&self, entity: &Entity) -> bool {
        self.read().iter().any(|e| e.ptr_eq(entity))
    }

    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<Entity>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<Entity>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.read().iter()).finish()
    }
}

// ============================================================================
// Cached values
// ============================================================================

/// Value held by a cache entry or a view field.
#[derive(Clone, Debug)]
pub enum Cached {
    Entity(Entity),
    Collection(Collection),
}

impl Cached {
    pub fn ptr_eq(&self, other: &Cached) -> bool {
        match (self, other) {
            (Cached::Entity(a), Cached::Entity(b)) => a.ptr_eq(b),
            (Cached::Collection(a), Cached::Collection(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Cached::Entity(e) => Some(e),
            Cached::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Cached::Collection(c) => Some(c),
            Cached::Entity(_) => None,
        }
    }
}

/// Handle types that a fetch can resolve to.
pub trait CachedValue: Clone + Send + Sync + 'static {
    /// Shape name used in error messages.
    const SHAPE: &'static str;

    fn from_cached(cached: Cached) -> Result<Self>;
}

impl CachedValue for Entity {
    const SHAPE: &'static str = "entity";

    fn from_cached(cached: Cached) -> Result<Self> {
        match cached {
            Cached::Entity(e) => Ok(e),
            Cached::Collection(_) => Err(Error::DeserializationError(
                "expected entity, cache holds a collection".to_string(),
            )),
        }
    }
}

impl CachedValue for Collection {
    const SHAPE: &'static str = "collection";

    fn from_cached(cached: Cached) -> Result<Self> {
        match cached {
            Cached::Collection(c) => Ok(c),
            Cached::Entity(_) => Err(Error::DeserializationError(
                "expected collection, cache holds an entity".to_string(),
            )),
        }
    }
}

/// Serialize a typed shape into a field record.
pub(crate) fn to_record<T: Serialize>(model: &T) -> Result<Record> {
    match serde_json::to_value(model) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::SerializationError(format!(
            "payload must serialize to an object, got {}",
            other
        ))),
        Err(e) => Err(Error::SerializationError(e.to_string())),
    }
}
