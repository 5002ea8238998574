//! Search Cache: TTL + LRU over materialized search results,
//! keyed by the normalized query plus its time window.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::record::LogRecord;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub expiration_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, max_size: 1024, expiration_ms: 60_000 }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub size: usize,
    pub evictions: u64,
}

struct CacheEntry {
    records: Vec<LogRecord>,
    start: i64,
    end: i64,
    computed_at: i64,
}

pub struct SearchCache {
    config: Mutex<CacheConfig>,
    entries: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SearchCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size.max(1)).unwrap();
        Self {
            config: Mutex::new(config),
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn configure(&self, config: CacheConfig) {
        let capacity = NonZeroUsize::new(config.max_size.max(1)).unwrap();
        let mut entries = self.entries.lock();
        entries.resize(capacity);
        *self.config.lock() = config;
    }

    pub fn config(&self) -> CacheConfig {
        self.config.lock().clone()
    }

    pub fn key(query: Option<&str>, is_regex: bool, start: i64, end: i64) -> String {
        let normalized = normalize(query.unwrap_or(""));
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([is_regex as u8]);
        hasher.update(start.to_be_bytes());
        hasher.update(end.to_be_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Returns a cached result if present and unexpired, counting the
    /// lookup as a hit or miss.
    pub fn get(&self, key: &str, now: i64) -> Option<Vec<LogRecord>> {
        if !self.config().enabled {
            return None;
        }
        let expiration_ms = self.config().expiration_ms;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.peek(key) {
            if now - entry.computed_at >= expiration_ms {
                entries.pop(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(key).map(|e| e.records.clone())
    }

    pub fn put(&self, key: String, records: Vec<LogRecord>, start: i64, end: i64, now: i64) {
        if !self.config().enabled {
            return;
        }
        let mut entries = self.entries.lock();
        let was_full = entries.len() >= entries.cap().get();
        if was_full && !entries.contains(&key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.put(key, CacheEntry { records, start, end, computed_at: now });
    }

    /// Invalidates every entry whose `[start, end)` window intersects the
    /// given range, used when the Index Engine commits or deletes records
    /// in that window.
    pub fn invalidate_intersecting(&self, start: i64, end: i64) {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.start < end && start < entry.end)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    /// Removes all entries older than `expirationMs`; intended to run on
    /// an `expirationMs / 4` cadence via the Background Scheduler.
    pub fn sweep(&self, now: i64) {
        let expiration_ms = self.config().expiration_ms;
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now - entry.computed_at >= expiration_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size: self.entries.lock().len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Collapses whitespace runs and lowercases bare tokens outside double
/// quotes, so `"Error  Foo"` and `error foo` share a cache key while a
/// quoted literal's case is preserved.
fn normalize(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut in_quotes = false;
    let mut last_was_space = false;
    for ch in query.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
            out.push(ch);
            last_was_space = false;
            continue;
        }
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        out.push(if in_quotes { ch } else { ch.to_ascii_lowercase() });
        last_was_space = false;
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    fn sample_record() -> LogRecord {
        LogRecordBuilder::new("s", "hi").build(1, i64::MAX)
    }

    #[test]
    fn normalize_collapses_whitespace_and_lowercases_bare_tokens() {
        assert_eq!(normalize("  Error   Foo "), "error foo");
        assert_eq!(normalize(r#"Error "Exact Case""#), r#"error "Exact Case""#);
    }

    #[test]
    fn hit_after_put_then_miss_after_expiration() {
        let cache = SearchCache::new(CacheConfig { enabled: true, max_size: 8, expiration_ms: 100 });
        let key = SearchCache::key(Some("error"), false, 0, 1000);
        cache.put(key.clone(), vec![sample_record()], 0, 1000, 0);

        assert!(cache.get(&key, 50).is_some());
        assert!(cache.get(&key, 200).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn invalidate_intersecting_drops_overlapping_entries() {
        let cache = SearchCache::new(CacheConfig::default());
        let key = SearchCache::key(Some("error"), false, 0, 1000);
        cache.put(key.clone(), vec![sample_record()], 0, 1000, 0);

        cache.invalidate_intersecting(500, 1500);
        assert!(cache.get(&key, 1).is_none());
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = SearchCache::new(CacheConfig { enabled: false, max_size: 8, expiration_ms: 60_000 });
        let key = SearchCache::key(Some("error"), false, 0, 1000);
        cache.put(key.clone(), vec![sample_record()], 0, 1000, 0);
        assert!(cache.get(&key, 1).is_none());
    }
}
