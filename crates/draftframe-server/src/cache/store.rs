//! Bounded response cache for raw upstream responses.
//!
//! Entries hold upstream bytes as received, before any interceptor injection. Freshness
//! is decided on read from the entry's [`ContentClass`] TTL; stale entries are removed
//! lazily. When the store is full, inserting a new key evicts the single entry with the
//! oldest `cached_at`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use draftframe_core::ContentClass;
use parking_lot::{Mutex, RwLock};

/// Time source for the store. Swappable so TTL behaviour can be tested deterministically.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Called with the tenant id after that tenant's entries are purged.
pub type InvalidationHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Cache key: `(tenant, normalized path and query, mode suffix)`.
///
/// Stored as its parts so tenant ids containing any character stay distinct. The `Display`
/// form is for logs only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    tenant_id: String,
    path: String,
    mode_suffix: String,
}

impl CacheKey {
    pub fn new(tenant_id: &str, path_and_query: &str, mode_suffix: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            path: normalize_path_and_query(path_and_query),
            mode_suffix: mode_suffix.to_string(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.tenant_id, self.mode_suffix, self.path)
    }
}

/// Leading slash, no fragment, query pairs sorted, empty query dropped.
pub fn normalize_path_and_query(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw.split('#').next().unwrap_or_default();
    let (path, query) = match raw.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw, None),
    };

    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    if let Some(query) = query {
        let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        if !pairs.is_empty() {
            pairs.sort_unstable();
            normalized.push('?');
            normalized.push_str(&pairs.join("&"));
        }
    }
    normalized
}

/// An observational copy of an upstream response.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub status: StatusCode,
    pub is_full_page: bool,
    pub content_type: Option<String>,
    pub class: ContentClass,
    pub cached_at: Instant,
    pub etag: Option<String>,
}

impl CacheEntry {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        class: ContentClass,
        is_full_page: bool,
    ) -> Self {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let etag = headers
            .get(axum::http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self {
            body,
            headers,
            status,
            is_full_page,
            content_type,
            class,
            cached_at: Instant::now(),
            etag,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) <= self.class.ttl()
    }
}

/// Bounded, TTL-tiered, process-local response cache.
pub struct CacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    clock: Clock,
    hooks: RwLock<Vec<InvalidationHook>>,
}

impl CacheStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(Instant::now))
    }

    pub fn with_clock(capacity: usize, clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            clock,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a fresh entry. Stale entries are removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = (self.clock)();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => {
                crate::metrics::record_cache_hit();
                Some(entry.clone())
            }
            Some(_) => {
                entries.remove(key);
                crate::metrics::set_cache_entries(entries.len());
                crate::metrics::record_cache_miss();
                tracing::debug!(key = %key, "cache entry expired");
                None
            }
            None => {
                crate::metrics::record_cache_miss();
                None
            }
        }
    }

    /// Store an entry, replacing any previous entry for the key. `cached_at` is set to now.
    pub fn set(&self, key: &CacheKey, mut entry: CacheEntry) {
        entry.cached_at = (self.clock)();
        let mut entries = self.entries.lock();

        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                crate::metrics::record_cache_eviction();
                tracing::debug!(key = %oldest, "cache entry evicted");
            }
        }

        entries.insert(key.clone(), entry);
        crate::metrics::set_cache_entries(entries.len());
    }

    /// Remove every entry belonging to a tenant and notify invalidation listeners.
    pub fn invalidate_prefix(&self, tenant_id: &str) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|k, _| k.tenant_id() != tenant_id);
            crate::metrics::set_cache_entries(entries.len());
            before - entries.len()
        };

        crate::metrics::record_cache_invalidation(removed);
        tracing::info!(tenant_id = %tenant_id, removed, "preview cache invalidated");

        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook(tenant_id);
        }
        removed
    }

    /// Register a listener notified after a tenant's entries are purged.
    pub fn register_invalidation_hook(&self, hook: InvalidationHook) {
        self.hooks.write().push(hook);
    }

    /// Handle for the external push pipeline to purge a tenant after it updates upstream.
    pub fn invalidation_handle(self: &Arc<Self>) -> InvalidationHandle {
        InvalidationHandle {
            store: Arc::clone(self),
        }
    }
}

/// Cloneable purge signal handed to collaborators that must not depend on gateway code.
#[derive(Clone)]
pub struct InvalidationHandle {
    store: Arc<CacheStore>,
}

impl InvalidationHandle {
    pub fn invalidate(&self, tenant_id: &str) -> usize {
        self.store.invalidate_prefix(tenant_id)
    }
}
