//! Metrics hooks for cache activity.
//!
//! Implement [`CacheMetrics`] to feed hits, misses, deduplicated requests,
//! backend round-trips and cascades into your monitoring system:
//!
//! ```ignore
//! use entity_sync::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str) {
//!         // counter!("entity_cache_hits").inc();
//!     }
//!     // ... implement other methods
//! }
//!
//! // let registry = Registry::with_metrics(Box::new(PrometheusMetrics));
//! ```
//!
//! The default methods log through the `log` crate; [`NoOpMetrics`] (the
//! registry default) discards everything.

use crate::backend::Method;
use std::time::Duration;

/// Kind of mutation a cascade propagated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for CascadeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CascadeKind::Create => write!(f, "create"),
            CascadeKind::Update => write!(f, "update"),
            CascadeKind::Delete => write!(f, "delete"),
        }
    }
}

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// A fetch found a value already cached.
    fn record_hit(&self, key: &str) {
        debug!("Cache HIT: {}", key);
    }

    /// A fetch found nothing cached.
    fn record_miss(&self, key: &str) {
        debug!("Cache MISS: {}", key);
    }

    /// A fetch joined a request already in flight.
    fn record_dedup(&self, key: &str) {
        debug!("Cache DEDUP: {}", key);
    }

    /// A backend round-trip finished (successfully or not).
    fn record_request(&self, method: Method, url: &str, duration: Duration) {
        debug!("Backend {} {} took {:?}", method, url, duration);
    }

    /// A request or mutation failed.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }

    /// A mutation was propagated into `touched` cache entries.
    fn record_cascade(&self, kind: CascadeKind, key: &str, touched: usize) {
        debug!("Cascade {} {} touched {} entries", kind, key, touched);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str) {}
    fn record_miss(&self, _key: &str) {}
    fn record_dedup(&self, _key: &str) {}
    fn record_request(&self, _method: Method, _url: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
    fn record_cascade(&self, _kind: CascadeKind, _key: &str, _touched: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recording {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl CacheMetrics for Recording {
        fn record_hit(&self, key: &str) {
            self.events.lock().unwrap().push(format!("hit {}", key));
        }

        fn record_cascade(&self, kind: CascadeKind, key: &str, touched: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} {} {}", kind, key, touched));
        }
    }

    #[test]
    fn test_custom_metrics_override_defaults() {
        let metrics = Recording::default();
        metrics.record_hit("/api/people");
        metrics.record_miss("/api/people/1");
        metrics.record_cascade(CascadeKind::Delete, "/api/people/1", 2);

        let events = metrics.events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["hit /api/people", "delete /api/people/1 2"]
        );
    }

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        metrics.record_request(Method::Get, "/api/people", Duration::from_millis(3));
        metrics.record_error("/api/people", "boom");
    }
}
