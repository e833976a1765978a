use std::time::{Duration, Instant};

use bytes::Bytes;
use common::CacheStats;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

/// Longest TTL an entry may carry.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub capacity_bytes: usize,
    pub default_ttl: Duration,
    /// Maximum number of live entries inspected per eviction pass, `None` scans everything.
    pub eviction_batch_limit: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            eviction_batch_limit: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry {key} is {size_bytes} bytes, cache capacity is {capacity_bytes} bytes")]
    EntryTooLarge {
        key: String,
        size_bytes: usize,
        capacity_bytes: usize,
    },
    #[error("entry {key} has a ttl of {ttl_secs}s, the maximum is {max_secs}s")]
    TtlOutOfRange {
        key: String,
        ttl_secs: u64,
        max_secs: u64,
    },
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    size_bytes: usize,
    expires_at: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Size-bounded response cache with per-entry TTL.
///
/// Entries are kept in insertion order. When space is needed, expired entries
/// are dropped first, then the live entry with the lowest access count is
/// evicted (earliest inserted wins ties). Access counts never decay unless
/// [`BoundedCache::decay_access_counts`] is called.
pub struct BoundedCache {
    config: CacheConfig,
    entries: IndexMap<String, CacheEntry>,
    size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl BoundedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: IndexMap::new(),
            size_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn put(
        &mut self,
        key: impl Into<String>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.put_at(key, value, ttl, Instant::now())
    }

    pub fn put_at(
        &mut self,
        key: impl Into<String>,
        value: Bytes,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<(), CacheError> {
        let key = key.into();
        let size_bytes = value.len();

        if size_bytes > self.config.capacity_bytes {
            return Err(CacheError::EntryTooLarge {
                key,
                size_bytes,
                capacity_bytes: self.config.capacity_bytes,
            });
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let expires_at = match now.checked_add(ttl) {
            Some(expires_at) if ttl <= MAX_TTL => expires_at,
            _ => {
                return Err(CacheError::TtlOutOfRange {
                    key,
                    ttl_secs: ttl.as_secs(),
                    max_secs: MAX_TTL.as_secs(),
                });
            }
        };

        if let Some(previous) = self.entries.shift_remove(&key) {
            self.size_bytes -= previous.size_bytes;
        }

        self.reclaim(size_bytes, now);

        self.entries.insert(
            key,
            CacheEntry {
                value,
                size_bytes,
                expires_at,
                access_count: 0,
            },
        );
        self.size_bytes += size_bytes;

        Ok(())
    }

    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<Bytes> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.access_count = entry.access_count.saturating_add(1);
                self.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => {}
            None => {
                self.misses += 1;
                return None;
            }
        }

        if let Some(expired) = self.entries.shift_remove(key) {
            self.size_bytes -= expired.size_bytes;
            self.expirations += 1;
            debug!(key = %key, "cache entry expired on read");
        }
        self.misses += 1;
        None
    }

    /// Live-entry check that leaves counters and access counts untouched.
    pub fn contains_live(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.is_live(now))
            .unwrap_or(false)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.shift_remove(key) {
            Some(entry) => {
                self.size_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.size_bytes = 0;
        removed
    }

    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut reclaimed_bytes = 0usize;

        self.entries.retain(|_, entry| {
            if entry.is_live(now) {
                true
            } else {
                reclaimed_bytes += entry.size_bytes;
                false
            }
        });

        let purged = before - self.entries.len();
        self.size_bytes -= reclaimed_bytes;
        self.expirations += purged as u64;
        purged
    }

    /// Halves every access count so that keys which were hot long ago become evictable again.
    pub fn decay_access_counts(&mut self) {
        for entry in self.entries.values_mut() {
            entry.access_count /= 2;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        let hit_ratio = if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        };

        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            entries: self.entries.len(),
            size_bytes: self.size_bytes,
            capacity_bytes: self.config.capacity_bytes,
            hit_ratio,
        }
    }

    fn reclaim(&mut self, incoming_bytes: usize, now: Instant) {
        if self.fits(incoming_bytes) {
            return;
        }

        let purged = self.purge_expired_at(now);
        if purged > 0 {
            debug!(purged, "reclaimed expired cache entries");
        }

        while !self.fits(incoming_bytes) {
            let Some(index) = self.eviction_candidate(now) else {
                break;
            };

            if let Some((key, entry)) = self.entries.shift_remove_index(index) {
                self.size_bytes -= entry.size_bytes;
                self.evictions += 1;
                debug!(
                    key = %key,
                    size_bytes = entry.size_bytes,
                    access_count = entry.access_count,
                    "evicted cache entry"
                );
            }
        }
    }

    fn fits(&self, incoming_bytes: usize) -> bool {
        self.size_bytes + incoming_bytes <= self.config.capacity_bytes
    }

    fn eviction_candidate(&self, now: Instant) -> Option<usize> {
        let scan_limit = self.config.eviction_batch_limit.unwrap_or(usize::MAX).max(1);

        self.entries
            .values()
            .enumerate()
            .filter(|(_, entry)| entry.is_live(now))
            .take(scan_limit)
            .min_by_key(|(_, entry)| entry.access_count)
            .map(|(index, _)| index)
    }
}
