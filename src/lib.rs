//! # entity-sync
//!
//! A client-side entity cache that keeps consumer-held views in sync with a
//! remote backend.
//!
//! ## Features
//!
//! - **Identity-stable:** one owned instance per `(namespace, id)`, shared by
//!   every collection, single-item entry and view that holds it
//! - **In-place merges:** responses are merged into existing handles, never
//!   swapped in, so a bound view only ever sees its contents change
//! - **Deduplicated:** one in-flight request per cache key; concurrent callers
//!   share its outcome, failures included
//! - **Cascading mutations:** create, update and delete are reflected in every
//!   cached collection of the namespace
//! - **Backend agnostic:** any transport implementing [`Backend`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use entity_sync::{Defaults, Registry, ResourceOptions, View};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Person {
//!     id: u64,
//!     first_name: String,
//! }
//!
//! // 1. One registry per process, with a fallback backend
//! let registry = Registry::init(Defaults::new().with_backend(http_backend));
//!
//! // 2. Declare resources
//! let people = registry.declare::<Person>(ResourceOptions::new("/api/people"))?;
//!
//! // 3. Bind fetches into a view; the field is set once, then mutated in place
//! let scope = View::new();
//! people.get_all().bind(&scope, "people").await?;
//!
//! // 4. Mutations cascade into every bound collection
//! people.delete(124).await?;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod cache;
pub mod cascade;
pub mod coordinator;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod key;
pub mod merge;
pub mod observability;
pub mod registry;
pub mod resource;
pub mod strategy;
pub mod view;

// Re-exports for convenience
pub use backend::{Backend, FnBackend, Method, MockBackend};
pub use cache::{CacheEntry, EntryState, ResourceCache};
pub use cascade::CascadeEngine;
pub use coordinator::RequestCoordinator;
pub use descriptor::{ResourceDescriptor, ResourceOptions};
pub use entity::{Cached, Collection, Entity, Identity, Record};
pub use error::{Error, Result};
pub use registry::{Defaults, Registry};
pub use resource::{Fetch, Resource, Target};
pub use strategy::FetchPolicy;
pub use view::{View, ViewBinder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
