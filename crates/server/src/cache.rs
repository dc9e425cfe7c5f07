//! Key-value expiry cache for short-lived protocol artifacts.
//!
//! Consents, OTP codes and reset codes live here under independent TTLs. The
//! conditional operations (`take`, `take_if_eq`, `replace_if_eq`,
//! `get_or_insert`) are single indivisible steps per key so callers never have
//! to stitch a read and a delete together.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Backend(String),
    #[error("Failed to encode or decode cached value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key namespaces, one per artifact type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Otp,
    Consent,
    AuthCode,
    ResetCode,
}

impl Namespace {
    fn prefix(self) -> &'static str {
        match self {
            Namespace::Otp => "otp",
            Namespace::Consent => "consent",
            Namespace::AuthCode => "auth_code",
            Namespace::ResetCode => "reset_code",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(namespace: Namespace, id: &str) -> Self {
        Self(format!("{}:{}", namespace.prefix(), id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn set(&self, key: &CacheKey, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// `None` when the key is missing or expired.
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Remove and return the live value.
    async fn take(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;

    /// Remove the entry only if its live value equals `expected`.
    async fn take_if_eq(&self, key: &CacheKey, expected: &str) -> Result<bool, CacheError>;

    /// Swap the value only if it still equals `expected`. The remaining TTL is kept.
    async fn replace_if_eq(
        &self,
        key: &CacheKey,
        expected: &str,
        value: String,
    ) -> Result<bool, CacheError>;

    /// Insert when no live entry exists; returns whichever value is stored afterwards.
    async fn get_or_insert(
        &self,
        key: &CacheKey,
        value: String,
        ttl: Duration,
    ) -> Result<String, CacheError>;

    /// Remaining lifetime of a live entry.
    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>, CacheError>;
}

/// JSON helpers on top of the raw string interface.
pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn KvCache,
    key: &CacheKey,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    cache.set(key, serde_json::to_string(value)?, ttl).await
}

pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn KvCache,
    key: &CacheKey,
) -> Result<Option<(T, String)>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some((serde_json::from_str(&raw)?, raw))),
        None => Ok(None),
    }
}

#[derive(Clone)]
pub struct CacheEntry<T> {
    data: T,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// In-process cache backed by a sharded map.
///
/// Per-key atomicity comes from the shard lock held by the map's entry API.
#[derive(Clone)]
pub struct MemoryCache {
    cache: Arc<DashMap<CacheKey, CacheEntry<String>>>,
    last_cleanup: Arc<std::sync::Mutex<Instant>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            last_cleanup: Arc::new(std::sync::Mutex::new(Instant::now())),
        }
    }

    /// Perform lazy cleanup if enough time has passed
    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock() {
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                *last_cleanup = Instant::now();
                drop(last_cleanup);

                self.cache.retain(|_, entry| !entry.is_expired());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn set(&self, key: &CacheKey, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.maybe_cleanup();
        self.cache.insert(key.clone(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        self.maybe_cleanup();
        Ok(self.cache.get(key).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.data().clone())
            }
        }))
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self
            .cache
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn take(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        Ok(self
            .cache
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(_, entry)| entry.data))
    }

    async fn take_if_eq(&self, key: &CacheKey, expected: &str) -> Result<bool, CacheError> {
        Ok(self
            .cache
            .remove_if(key, |_, entry| !entry.is_expired() && entry.data() == expected)
            .is_some())
    }

    async fn replace_if_eq(
        &self,
        key: &CacheKey,
        expected: &str,
        value: String,
    ) -> Result<bool, CacheError> {
        match self.cache.get_mut(key) {
            Some(mut entry) if !entry.is_expired() && entry.data() == expected => {
                entry.data = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_or_insert(
        &self,
        key: &CacheKey,
        value: String,
        ttl: Duration,
    ) -> Result<String, CacheError> {
        self.maybe_cleanup();
        match self.cache.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(CacheEntry::new(value.clone(), ttl));
                    Ok(value)
                } else {
                    Ok(occupied.get().data().clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value.clone(), ttl));
                Ok(value)
            }
        }
    }

    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>, CacheError> {
        Ok(self
            .cache
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.remaining()))
    }
}
