//! In-process cache backend.
//!
//! A bounded LRU map behind a single mutex. Expiry is lazy: stale entries are
//! dropped when read, so one may be served just past its deadline by a reader
//! that raced the cleanup.

use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use super::{CacheBackend, CacheEntry};
use crate::error::CacheError;

pub struct MemoryBackend {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryBackend {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.is_expired(Utc::now()) => true,
            Some(entry) => return Ok(Some(entry.clone())),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries.lock().put(key.to_string(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().pop(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.lock().len())
    }
}
