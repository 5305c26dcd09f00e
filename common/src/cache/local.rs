// In-process cache backend

use super::{qualify_key, Cache, CacheBackend, Codec, Expiration, KeyPattern};
use crate::errors::CacheError;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct LocalEntry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
    sliding: Option<Duration>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Push a sliding entry's deadline out again after a read
    fn touch(&mut self, now: Instant) {
        if let Some(window) = self.sliding {
            self.expires_at = now.checked_add(window);
        }
    }
}

/// Thread-safe in-process store.
///
/// The entry map doubles as the key index used for pattern operations.
/// Expired entries are dropped lazily on access and by `purge_expired`.
/// Coordinates only tasks inside this process.
#[derive(Debug, Clone, Default)]
pub struct LocalCacheStore {
    entries: Arc<Mutex<HashMap<String, LocalEntry>>>,
}

impl LocalCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LocalEntry>> {
        // Entries stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live entries across all namespaces
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live qualified keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn read(&self, qualified_key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = entries.get_mut(qualified_key)?;
        if !entry.is_expired(now) {
            entry.touch(now);
            return Some(entry.payload.clone());
        }
        entries.remove(qualified_key);
        None
    }

    fn write(&self, qualified_key: &str, payload: Vec<u8>, expiration: Expiration) {
        let now = Instant::now();
        let ttl = expiration.ttl_from(Utc::now());
        let entry = LocalEntry {
            payload,
            // A deadline past the clock's range never arrives
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            sliding: match expiration {
                Expiration::Sliding(window) => Some(window),
                _ => None,
            },
        };
        self.entries().insert(qualified_key.to_string(), entry);
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Periodically purge expired entries until shutdown
    pub fn spawn_sweeper(&self, every: Duration, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = every.as_millis() as u64, "Local cache sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            debug!(removed, "Purged expired cache entries");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Local cache sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Blocking read for callers outside an async context
    pub fn get_now<T: DeserializeOwned>(&self, app_name: &str, key: &str) -> Option<T> {
        let payload = self.read(&qualify_key(app_name, key))?;
        Codec::MessagePack.decode(&payload).ok()
    }

    /// Blocking write for callers outside an async context
    pub fn set_now<T: Serialize + ?Sized>(
        &self,
        app_name: &str,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> Result<(), CacheError> {
        let qualified = qualify_key(app_name, key);
        if expiration.is_elapsed(Utc::now()) {
            self.entries().remove(&qualified);
            return Ok(());
        }
        let payload = Codec::MessagePack.encode(value)?;
        self.write(&qualified, payload, expiration);
        Ok(())
    }

    /// Typed async facade sharing this store
    pub fn to_cache(&self) -> Cache {
        Cache::new(Arc::new(self.clone()))
    }
}

#[async_trait]
impl CacheBackend for LocalCacheStore {
    fn codec(&self) -> Codec {
        Codec::MessagePack
    }

    async fn get(&self, qualified_key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.read(qualified_key))
    }

    fn get_blocking(&self, qualified_key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.read(qualified_key))
    }

    async fn get_matching(
        &self,
        pattern: &KeyPattern,
    ) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        let matcher = pattern.to_regex()?;
        let now = Instant::now();
        let mut entries = self.entries();
        entries.retain(|_, e| !e.is_expired(now));

        let mut matched: Vec<(String, Vec<u8>)> = entries
            .iter_mut()
            .filter(|(k, _)| matcher.is_match(k))
            .map(|(k, e)| {
                e.touch(now);
                (k.clone(), e.payload.clone())
            })
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matched)
    }

    async fn set(
        &self,
        qualified_key: &str,
        payload: Vec<u8>,
        expiration: Expiration,
    ) -> Result<(), CacheError> {
        self.write(qualified_key, payload, expiration);
        Ok(())
    }

    async fn remove(&self, qualified_key: &str) -> Result<(), CacheError> {
        self.entries().remove(qualified_key);
        Ok(())
    }

    async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let matcher = pattern.to_regex()?;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|k, _| !matcher.is_match(k));
        Ok(before - entries.len())
    }

    async fn dispose(&self) {
        self.entries().clear();
    }
}
