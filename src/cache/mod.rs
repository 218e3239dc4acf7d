//! In-memory response cache with conditional revalidation support.
//!
//! Entries are keyed by the normalized request signature and served
//! without a network call only while fresh (`now < stored_at + max_age`).
//! A stale entry with an ETag is kept so the dispatcher can revalidate it
//! conditionally; it is never served blindly. The cache is bounded by a
//! byte budget with LRU eviction.

use crate::request::ApiRequest;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    payload: Bytes,
    etag: Option<String>,
    stored_at: Instant,
    max_age: Duration,
    request: ApiRequest,
    hits: u64,
    last_used: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.stored_at + self.max_age
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Cached payload bytes.
    pub payload: Bytes,
    /// Cache validator for conditional revalidation.
    pub etag: Option<String>,
    /// True if the entry is within its freshness window.
    pub fresh: bool,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    tick: u64,
}

/// Size-bounded LRU cache of GET responses.
pub struct ResponseCache {
    budget_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    /// Creates a cache with the given byte budget.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
                tick: 0,
            }),
        }
    }

    /// Looks up an entry, bumping its LRU position and hit count.
    pub fn lookup(&self, signature: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        let now = Instant::now();
        let entry = inner.entries.get_mut(signature)?;
        entry.last_used = tick;
        entry.hits += 1;
        Some(CachedResponse {
            payload: entry.payload.clone(),
            etag: entry.etag.clone(),
            fresh: entry.is_fresh(now),
        })
    }

    /// Stores a response, evicting the coldest entries if over budget.
    pub fn store(
        &self,
        request: &ApiRequest,
        payload: Bytes,
        etag: Option<String>,
        max_age: Duration,
    ) {
        // Oversized payloads would evict the whole cache for one entry.
        if payload.len() > self.budget_bytes {
            return;
        }
        let signature = request.signature();
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(old) = inner.entries.remove(&signature) {
            inner.total_bytes -= old.payload.len();
        }
        inner.total_bytes += payload.len();
        inner.entries.insert(
            signature,
            CacheEntry {
                payload,
                etag,
                stored_at: Instant::now(),
                max_age,
                request: request.clone(),
                hits: 0,
                last_used: tick,
            },
        );

        while inner.total_bytes > self.budget_bytes {
            let coldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match coldest {
                Some(key) => {
                    if let Some(evicted) = inner.entries.remove(&key) {
                        inner.total_bytes -= evicted.payload.len();
                        tracing::debug!(signature = %key, "Evicted cache entry");
                    }
                }
                None => break,
            }
        }
    }

    /// Re-stamps an entry's freshness window after a 304 revalidation,
    /// updating the validator if the server sent a new one.
    pub fn restamp(&self, signature: &str, etag: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(signature) {
            entry.stored_at = Instant::now();
            if etag.is_some() {
                entry.etag = etag;
            }
        }
    }

    /// Removes one entry.
    pub fn invalidate(&self, signature: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(signature) {
            inner.total_bytes -= entry.payload.len();
        }
    }

    /// Removes every entry whose signature starts with `prefix`, so a
    /// mutation against a resource drops all cached list/detail views of it.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes -= entry.payload.len();
            }
        }
    }

    /// Destroys all entries. Called on logout.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    /// Returns the requests behind stale entries that carry an ETag and
    /// have been hit at least `min_hits` times, for background
    /// revalidation.
    pub fn stale_hot_entries(&self, min_hits: u64) -> Vec<ApiRequest> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .entries
            .values()
            .filter(|e| !e.is_fresh(now) && e.etag.is_some() && e.hits >= min_hits)
            .map(|e| e.request.clone())
            .collect()
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total cached payload bytes.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }
}
