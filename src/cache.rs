//! TTL-based verdict cache.

use crate::policy::Verdict;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Error from a verdict store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The backing store cannot be read or written.
    #[error("verdict cache unavailable: {0}")]
    Unavailable(String),
}

/// Storage for gate verdicts.
///
/// Implementations must not block on external lookups. A failed read or write
/// is reported as [`CacheError`], never as a miss.
#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// Get the cached verdict for an address if present and not expired.
    async fn get(&self, address: &str) -> Result<Option<Verdict>, CacheError>;

    /// Store a verdict, replacing any existing entry and resetting its expiry.
    async fn put(&self, address: &str, verdict: Verdict, ttl: Duration)
        -> Result<(), CacheError>;
}

/// Cached verdict.
#[derive(Debug, Clone)]
pub struct CachedVerdict {
    pub verdict: Verdict,
    /// When this entry was cached.
    pub cached_at: Instant,
    /// TTL for this entry.
    pub ttl: Duration,
}

impl CachedVerdict {
    /// Check if this cache entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// In-process verdict cache, sharded per key.
pub struct MemoryVerdictCache {
    entries: DashMap<String, CachedVerdict>,
    max_entries: usize,
}

impl MemoryVerdictCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up an entry, ignoring expired ones.
    pub fn get_entry(&self, address: &str) -> Option<CachedVerdict> {
        let entry = self.entries.get(address)?;
        if entry.is_expired() {
            // Lazy expiry, the sweep in cleanup() reclaims the slot
            None
        } else {
            Some(entry.clone())
        }
    }

    /// Insert a verdict, evicting if the cache is full.
    pub fn insert(&self, address: &str, verdict: Verdict, ttl: Duration) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(address) {
            self.cleanup();

            if self.entries.len() >= self.max_entries {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|e| e.value().cached_at)
                    .map(|e| e.key().clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }

        self.entries.insert(
            address.to_string(),
            CachedVerdict {
                verdict,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove expired entries from the cache.
    pub fn cleanup(&self) {
        self.entries.retain(|_, v| !v.is_expired());
    }

    /// Get the number of entries in the cache, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl VerdictStore for MemoryVerdictCache {
    async fn get(&self, address: &str) -> Result<Option<Verdict>, CacheError> {
        Ok(self.get_entry(address).map(|e| e.verdict))
    }

    async fn put(
        &self,
        address: &str,
        verdict: Verdict,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.insert(address, verdict, ttl);
        Ok(())
    }
}
