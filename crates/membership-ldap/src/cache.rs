//! Time-bounded group caches and the registry that memoizes them.

use membership_core::{CacheConfigId, CacheConfiguration, Error};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{members::GroupMembers, Result};

struct CacheEntry {
    members: Arc<GroupMembers>,
    inserted_at: Instant,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a live entry
    pub hits: u64,
    /// Lookups that found no entry
    pub misses: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries currently stored (expired ones included until they are read or purged)
    pub entries: usize,
    /// Configured capacity, if bounded
    pub capacity: Option<usize>,
}

impl CacheStats {
    /// Calculate cache hit ratio (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// In-memory cache of group memberships keyed by canonical group DN.
///
/// Entries are never mutated after insertion: a read returns the stored `Arc`, and a
/// refresh replaces the whole entry. Expiry is lazy, checked on read.
pub struct GroupCache {
    config: CacheConfiguration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl GroupCache {
    /// Creates an empty cache for the given configuration.
    #[must_use]
    pub fn new(config: CacheConfiguration) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Configuration this cache was created from.
    #[must_use]
    pub const fn config(&self) -> &CacheConfiguration {
        &self.config
    }

    /// Returns the live entry for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the cache lock is poisoned.
    pub fn get(&self, key: &str) -> Result<Option<Arc<GroupMembers>>> {
        {
            let entries = self.entries.read().map_err(|_| poisoned(&self.config))?;
            match entries.get(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(entry) if !self.is_expired(entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.members.clone()));
                }
                Some(_) => {}
            }
        }

        // Re-check under the write lock: another caller may have refreshed the entry.
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.config))?;
        if let Some(entry) = entries.get(key) {
            if !self.is_expired(entry) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.members.clone()));
            }
            entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(cache = self.config.name(), key, "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Stores `members` under `key`, replacing any previous entry.
    ///
    /// When the cache is full the oldest entry is evicted first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the cache lock is poisoned.
    pub fn put(&self, key: impl Into<String>, members: Arc<GroupMembers>) -> Result<()> {
        let key = key.into();
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.config))?;

        if let Some(capacity) = self.config.capacity() {
            if !entries.contains_key(&key) && entries.len() >= capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    debug!(cache = self.config.name(), key = %oldest, "evicted oldest cache entry");
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                members,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Drops the entry for `key`. Returns true if one was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the cache lock is poisoned.
    pub fn invalidate(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.config))?;
        Ok(entries.remove(key).is_some())
    }

    /// Drops every entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the cache lock is poisoned.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.config))?;
        entries.clear();
        Ok(())
    }

    /// Removes all expired entries and returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the cache lock is poisoned.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().map_err(|_| poisoned(&self.config))?;
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry));
        let purged = before - entries.len();
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        Ok(purged)
    }

    /// Number of stored entries, expired ones included until they are read or purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.config.capacity(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        entry.inserted_at.elapsed() >= self.config.ttl()
    }
}

/// Registry handing out exactly one [`GroupCache`] per cache configuration identity.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<CacheConfigId, Arc<GroupCache>>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cache registered for `config`, creating it on first use.
    ///
    /// Concurrent first calls for the same configuration observe the same instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the registry lock is poisoned.
    pub fn get_or_create(&self, config: &CacheConfiguration) -> Result<Arc<GroupCache>> {
        if let Some(cache) = self
            .caches
            .read()
            .map_err(|_| registry_poisoned())?
            .get(&config.id())
        {
            return Ok(cache.clone());
        }

        let mut caches = self.caches.write().map_err(|_| registry_poisoned())?;
        let cache = caches.entry(config.id()).or_insert_with(|| {
            info!(
                cache = config.name(),
                id = %config.id(),
                ttl_secs = config.ttl().as_secs(),
                "creating group cache"
            );
            Arc::new(GroupCache::new(config.clone()))
        });
        Ok(cache.clone())
    }

    /// Clears the entries of every registered cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if a lock is poisoned.
    pub fn clear_all(&self) -> Result<()> {
        let caches = self.caches.read().map_err(|_| registry_poisoned())?;
        caches.values().try_for_each(|cache| cache.clear())
    }

    /// Number of registered caches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no cache has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(config: &CacheConfiguration) -> Error {
    Error::CacheError(format!("cache `{}` lock poisoned", config.name()))
}

fn registry_poisoned() -> Error {
    Error::CacheError("cache registry lock poisoned".to_string())
}
