//! # Request Cache
//!
//! Keyed memoization scoped to one request. Components rendered anywhere in
//! the tree share it through their [`RenderContext`](crate::RenderContext).
//!
//! Entries are keyed by `(type, key)`, so two callers using the same string
//! key for different value types never collide. The lock is never held while
//! `compute` runs; if two computations race for one key the first stored
//! value wins and both callers observe it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Slot = (TypeId, String);

/// Per-request keyed cache.
#[derive(Default)]
pub struct RequestCache {
    entries: Mutex<HashMap<Slot, Arc<dyn Any + Send + Sync>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RequestCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key`, computing and storing it on a miss.
    pub fn get_or_compute<T, F>(&self, key: &str, compute: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let slot = (TypeId::of::<T>(), key.to_owned());
        if let Some(value) = self.lookup::<T>(&slot) {
            return value;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute();
        self.store(slot, value)
    }

    /// Like [`RequestCache::get_or_compute`], but failures are returned and
    /// not cached.
    ///
    /// # Errors
    ///
    /// Whatever `compute` returns.
    pub fn try_get_or_compute<T, E, F>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let slot = (TypeId::of::<T>(), key.to_owned());
        if let Some(value) = self.lookup::<T>(&slot) {
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute()?;
        Ok(self.store(slot, value))
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// `(hits, misses)` so far.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn lookup<T: Clone + 'static>(&self, slot: &Slot) -> Option<T> {
        let cached = {
            let entries = self.entries.lock();
            entries
                .get(slot)
                .and_then(|value| value.downcast_ref::<T>())
                .cloned()
        };
        if cached.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        cached
    }

    fn store<T: Clone + Send + Sync + 'static>(&self, slot: Slot, value: T) -> T {
        let mut entries = self.entries.lock();
        let stored = entries
            .entry(slot)
            .or_insert_with(|| Arc::new(value.clone()));
        stored.downcast_ref::<T>().cloned().unwrap_or(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_computes_once_per_key() {
        let cache = RequestCache::new();
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            String::from("user-1")
        };

        assert_eq!(cache.get_or_compute("user", compute), "user-1");
        assert_eq!(cache.get_or_compute("user", || String::from("other")), "user-1");
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_types_do_not_collide() {
        let cache = RequestCache::new();
        assert_eq!(cache.get_or_compute("k", || 7_u32), 7);
        assert_eq!(cache.get_or_compute("k", || String::from("seven")), "seven");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = RequestCache::new();
        let failed: Result<u8, &str> = cache.try_get_or_compute("k", || Err("down"));
        assert_eq!(failed, Err("down"));
        assert!(cache.is_empty());

        let ok: Result<u8, &str> = cache.try_get_or_compute("k", || Ok(1));
        assert_eq!(ok, Ok(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reentrant_compute_does_not_deadlock() {
        let cache = RequestCache::new();
        let outer = cache.get_or_compute("outer", || cache.get_or_compute("inner", || 2_i32) + 1);
        assert_eq!(outer, 3);
    }
}
