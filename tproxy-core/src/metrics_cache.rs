//! Metrics label caching to reduce allocations
//!
//! Caches host label strings so the per-connection hot path does not
//! re-allocate the same label for every flow to a popular destination.

use dashmap::DashMap;
use std::sync::Arc;

pub struct MetricLabelCache {
    cache: DashMap<String, Arc<str>>,
}

impl MetricLabelCache {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Get or create a cached label for a host; the returned `Arc<str>` is
    /// cheap to clone.
    pub fn get_or_insert(&self, host: &str) -> Arc<str> {
        self.cache
            .entry(host.to_string())
            .or_insert_with(|| Arc::from(host))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for MetricLabelCache {
    fn default() -> Self {
        Self::new()
    }
}
