//! Cache-aside store for provider results.
//!
//! Keys are normalized `(target URL, operation kind)` pairs so that
//! syntactic URL variants (fragments, default ports, surrounding
//! whitespace) share one entry. Values are opaque JSON payloads; for a
//! given key the last write wins and entries never expire unless the store
//! is constructed with a capacity bound.
//!
//! Store failures never fail a request: the dispatch layer treats an
//! unavailable backend as a permanent miss.

pub mod single_flight;

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::error::GatewayError;
use crate::provider::MediaKind;

/// Normalized cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    url: String,
    kind: MediaKind,
}

impl CacheKey {
    /// Build a key from a raw target URL and operation kind.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Validation` if the URL does not parse.
    pub fn new(raw_url: &str, kind: MediaKind) -> Result<Self, GatewayError> {
        let mut url = Url::parse(raw_url.trim())
            .map_err(|e| GatewayError::Validation(format!("malformed url: {e}")))?;
        // The fragment never reaches the origin; two targets differing only
        // in fragment are the same resource.
        url.set_fragment(None);
        Ok(Self {
            url: url.to_string(),
            kind,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }
}

/// Cache backend errors. Always swallowed by the dispatch layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
}

/// Key/value store for provider results.
///
/// Implementations must be safe under concurrent `get`/`put` across keys;
/// per-key consistency is last-write-wins.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>, CacheError>;
    async fn put(&self, key: &CacheKey, value: Value) -> Result<(), CacheError>;
}

/// In-memory cache store.
///
/// Unbounded by default, matching the process-lifetime cache semantics of
/// the gateway. [`MemoryCache::bounded`] is the eviction extension point:
/// when a capacity is set, the oldest inserted keys are evicted first.
pub struct MemoryCache {
    entries: DashMap<CacheKey, Value>,
    insertion_order: Mutex<VecDeque<CacheKey>>,
    capacity: Option<usize>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
            capacity: None,
        }
    }

    /// Cache with a maximum entry count; oldest entries are evicted first.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_over_capacity(&self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        let mut order = match self.insertion_order.lock() {
            Ok(guard) => guard,
            // A poisoned order queue only degrades eviction, not correctness.
            Err(poisoned) => poisoned.into_inner(),
        };
        while self.entries.len() > capacity {
            match order.pop_front() {
                Some(oldest) => {
                    if self.entries.remove(&oldest).is_some() {
                        debug!(url = %oldest.url(), kind = %oldest.kind(), "Evicted cache entry");
                    }
                }
                None => break,
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Value>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &CacheKey, value: Value) -> Result<(), CacheError> {
        let replaced = self.entries.insert(key.clone(), value).is_some();
        if !replaced {
            let mut order = match self.insertion_order.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            order.push_back(key.clone());
        }
        self.evict_over_capacity();
        Ok(())
    }
}
