//! In-memory LRU of rendered results, keyed by normalized query.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Case-insensitive, outer-whitespace-trimmed. Inner spacing and punctuation are kept.
pub fn normalize_query(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub rendered: String,
    pub inserted_at: Instant,
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

pub struct ResultCache {
    inner: LruCache<String, CacheEntry>,
    ttl: Option<Duration>,
}

impl ResultCache {
    /// A zero `max` is raised to 1.
    pub fn new(max: usize, ttl: Option<Duration>) -> Self {
        let cap = NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(cap),
            ttl,
        }
    }

    /// A hit promotes the entry. Expired entries are misses and stay until overwritten
    /// or evicted.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<String> {
        if !self.inner.peek(key)?.is_live(now) {
            return None;
        }
        self.inner.get(key).map(|e| e.rendered.clone())
    }

    /// Returns the key evicted to make room, if any.
    pub fn put(&mut self, key: String, rendered: String, now: Instant) -> Option<String> {
        let entry = CacheEntry {
            key: key.clone(),
            rendered,
            inserted_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };
        match self.inner.push(key, entry) {
            Some((evicted, _)) if !self.inner.contains(&evicted) => Some(evicted),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
