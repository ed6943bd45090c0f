//! Result cache keyed by statement fingerprint
//!
//! An entry is reusable only while the database's modification generation
//! still equals the generation it was captured at. Stale entries are
//! dropped lazily, on the lookup that finds them.
//!
//! Lookup and store are not atomic as a pair. Two sessions may both miss and
//! both compute; the generation comparison alone decides correctness.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use keystone_core::StoreResult;

use crate::statement::Fingerprint;
use crate::value::{Row, Rows};

#[derive(Debug, Clone)]
struct CacheEntry {
    rows: Rows,
    generation: u64,
}

/// Counters for comparison runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Executions that ran the statement body
    pub misses: u64,
    /// Entries currently held
    pub entries: usize,
}

/// Bounded LRU cache of captured result sets.
#[derive(Debug)]
pub struct ResultCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Cache holding at most `capacity` result sets.
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            enabled: AtomicBool::new(enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached rows for `key` if they were captured at the current
    /// `generation`; otherwise run `compute` and capture its rows.
    ///
    /// Non-cacheable statements and a disabled cache always run `compute` and
    /// never store. A result is stored only if `generation` did not move
    /// while `compute` ran, tagged with that generation.
    pub fn lookup_or_compute<F>(
        &self,
        key: &Fingerprint,
        cacheable: bool,
        generation: &AtomicU64,
        compute: F,
    ) -> StoreResult<Rows>
    where
        F: FnOnce() -> StoreResult<Vec<Row>>,
    {
        if !cacheable || !self.is_enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return compute().map(Rows::from);
        }

        let before = generation.load(Ordering::SeqCst);
        {
            let mut entries = self.entries.lock();
            let stale = match entries.get(key) {
                Some(entry) if entry.generation == before => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(&entry.rows));
                }
                Some(entry) => Some(entry.generation),
                None => None,
            };
            if let Some(captured) = stale {
                debug!(
                    statement = %key.statement(),
                    captured,
                    current = before,
                    "cached result invalidated by write"
                );
                entries.pop(key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let rows: Rows = compute()?.into();

        let after = generation.load(Ordering::SeqCst);
        if after == before && self.is_enabled() {
            let entry = CacheEntry {
                rows: Arc::clone(&rows),
                generation: before,
            };
            self.entries.lock().put(key.clone(), entry);
        }
        Ok(rows)
    }

    /// True if lookups may be answered from the cache.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// `OPTIMIZE_REUSE_RESULTS`. Disabling drops every entry.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "result reuse changed");
            if !enabled {
                self.clear();
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries held, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters and current size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
