use std::sync::Mutex;

use kpath_common::path::{PathValue, PATH_KEY_SIZE};
use lru_st::collections::LruHashMap;

pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// Serialized [`kpath_common::path::PathKey`]
pub type Key = [u8; PATH_KEY_SIZE];

/// Bounded LRU cache of decoded `pathnames` entries, shared
/// between all the threads resolving paths.
///
/// A poisoned lock is never propagated: lookups behave as misses
/// and insertions are dropped, the caller falls back to the table.
pub struct ResolutionCache {
    cap: usize,
    lru: Mutex<LruHashMap<Key, PathValue>>,
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_CACHE_SIZE)
    }
}

impl ResolutionCache {
    pub fn with_max_entries(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            lru: Mutex::new(LruHashMap::with_max_entries(cap)),
        }
    }

    #[inline(always)]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn get(&self, key: &Key) -> Option<PathValue> {
        let mut lru = self.lru.lock().ok()?;
        lru.get(key).copied()
    }

    #[inline]
    pub fn put(&self, key: Key, value: PathValue) {
        if let Ok(mut lru) = self.lru.lock() {
            lru.insert(key, value);
        }
    }

    /// Drops a single entry, used when the kernel is known
    /// to have reused an inode
    #[inline]
    pub fn invalidate(&self, key: &Key) {
        if let Ok(mut lru) = self.lru.lock() {
            lru.remove(key);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut lru) = self.lru.lock() {
            *lru = LruHashMap::with_max_entries(self.cap);
        }
    }

    // panics while holding the lock
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        std::thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _guard = self.lru.lock().unwrap();
                    panic!("cache lock poisoned on purpose");
                })
                .join();
        });
        assert!(self.lru.is_poisoned());
    }
}
