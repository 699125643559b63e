//! Fetch policies: how a fetch treats a cache hit.
//!
//! # The Three Policies
//!
//! ```
//! use entity_sync::strategy::FetchPolicy;
//!
//! // 1. Revalidate - serve the cached value now, refresh from the backend (default)
//! let _p = FetchPolicy::Revalidate;
//!
//! // 2. CacheFirst - serve the cached value, no request when it is fresh
//! let _p = FetchPolicy::CacheFirst;
//!
//! // 3. Invalidate - drop the entry, then fetch
//! let _p = FetchPolicy::Invalidate;
//! ```
//!
//! | Policy | Fresh hit | Pending | Miss |
//! |--------|-----------|---------|------|
//! | **Revalidate** | cached value + backend request | join in-flight | backend request |
//! | **CacheFirst** | cached value, no request | join in-flight | backend request |
//! | **Invalidate** | evict, backend request | join in-flight | backend request |
//!
//! A pending entry always joins the request already in flight; no policy
//! issues a second concurrent request for the same key.

/// Policy controlling whether a cache hit also goes to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// **Revalidate**: return the cached value immediately and still refresh.
    ///
    /// A cache hit is a latency optimization, not a substitute for the
    /// backend. The refreshed payload is merged into the same instances the
    /// caller already holds.
    #[default]
    Revalidate,

    /// **CacheFirst**: a fresh cached value resolves the fetch with no request.
    ///
    /// Use when: the data is known to be current (e.g. right after a
    /// fetch-all seeded the member entries).
    CacheFirst,

    /// **Invalidate**: evict the entry, then fetch from the backend.
    ///
    /// Views bound to the evicted entry keep their handle; the owned
    /// instance or collection handle survives eviction, so the refetch
    /// merges into it.
    Invalidate,
}

impl std::fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchPolicy::Revalidate => write!(f, "Revalidate"),
            FetchPolicy::CacheFirst => write!(f, "CacheFirst"),
            FetchPolicy::Invalidate => write!(f, "Invalidate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_display() {
        assert_eq!(FetchPolicy::Revalidate.to_string(), "Revalidate");
        assert_eq!(FetchPolicy::CacheFirst.to_string(), "CacheFirst");
        assert_eq!(FetchPolicy::Invalidate.to_string(), "Invalidate");
    }

    #[test]
    fn test_policy_default_revalidates() {
        assert_eq!(FetchPolicy::default(), FetchPolicy::Revalidate);
    }
}
