// Namespaced expiring key-value cache with local and Redis backends

pub mod local;
pub mod pattern;
pub mod redis;

pub use local::LocalCacheStore;
pub use pattern::{qualify_key, unqualify_key, KeyPattern};
pub use redis::RedisCacheStore;

use crate::config::{CacheBackendKind, CacheSettings};
use crate::errors::CacheError;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// When a cache entry stops being readable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Lives until removed
    Never,
    /// Expires at an absolute UTC instant
    At(DateTime<Utc>),
    /// Expires a fixed duration after it was written
    After(Duration),
    /// Expires after going unread for the given duration; every read re-arms it
    Sliding(Duration),
}

impl Expiration {
    /// Whether an entry written now with this expiration would already be gone
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self {
            Expiration::Never => false,
            Expiration::At(at) => *at <= now,
            Expiration::After(ttl) | Expiration::Sliding(ttl) => ttl.is_zero(),
        }
    }

    /// Time left before expiry, measured from `now`
    pub fn ttl_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Expiration::Never => None,
            Expiration::At(at) => Some((*at - now).to_std().unwrap_or(Duration::ZERO)),
            Expiration::After(ttl) | Expiration::Sliding(ttl) => Some(*ttl),
        }
    }
}

/// Payload encoding used by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Compact binary encoding for the in-process store
    MessagePack,
    /// Text encoding for the shared networked store
    Json,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        match self {
            Codec::MessagePack => Ok(rmp_serde::to_vec(value)?),
            Codec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CacheError> {
        match self {
            Codec::MessagePack => rmp_serde::from_slice(payload)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            Codec::Json => Ok(serde_json::from_slice(payload)?),
        }
    }
}

/// Storage backend operating on qualified keys and encoded payloads.
///
/// Backends never see unqualified keys; `Cache` adds the namespace.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Encoding this backend stores payloads in
    fn codec(&self) -> Codec;

    /// Read one entry, re-arming sliding expiration on a hit
    async fn get(&self, qualified_key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Same as `get`, blocking the calling thread. Do not call from async code.
    fn get_blocking(&self, qualified_key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Read every entry whose qualified key matches the pattern
    async fn get_matching(
        &self,
        pattern: &KeyPattern,
    ) -> Result<Vec<(String, Vec<u8>)>, CacheError>;

    /// Write one entry, replacing any previous value and expiration
    async fn set(
        &self,
        qualified_key: &str,
        payload: Vec<u8>,
        expiration: Expiration,
    ) -> Result<(), CacheError>;

    async fn remove(&self, qualified_key: &str) -> Result<(), CacheError>;

    /// Remove every entry matching the pattern, returning how many were removed
    async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize, CacheError>;

    /// Release underlying resources. Safe to call more than once.
    async fn dispose(&self);
}

/// Typed, namespace-qualifying facade over a `CacheBackend`
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// A cache over a fresh in-process store
    pub fn local() -> Self {
        Self::new(Arc::new(LocalCacheStore::new()))
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Read and decode one entry.
    ///
    /// A payload that fails to decode is logged and reported as a miss.
    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(
        &self,
        app_name: &str,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let qualified = qualify_key(app_name, key);
        let Some(payload) = self.backend.get(&qualified).await? else {
            return Ok(None);
        };

        Ok(self.decode_or_miss(&qualified, &payload))
    }

    /// Blocking form of `get` for callers without a runtime.
    ///
    /// Inside a Tokio runtime call it through `spawn_blocking`.
    #[instrument(skip(self))]
    pub fn get_blocking<T: DeserializeOwned>(
        &self,
        app_name: &str,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let qualified = qualify_key(app_name, key);
        let Some(payload) = self.backend.get_blocking(&qualified)? else {
            return Ok(None);
        };
        Ok(self.decode_or_miss(&qualified, &payload))
    }

    fn decode_or_miss<T: DeserializeOwned>(&self, qualified: &str, payload: &[u8]) -> Option<T> {
        match self.backend.codec().decode(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %qualified, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Read and decode every entry matching `key_pattern` in the namespace.
    ///
    /// Entries that fail to decode are skipped.
    #[instrument(skip(self))]
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        app_name: &str,
        key_pattern: &str,
    ) -> Result<Vec<T>, CacheError> {
        let pattern = KeyPattern::new(app_name, key_pattern);
        let codec = self.backend.codec();
        let entries = self.backend.get_matching(&pattern).await?;

        let mut values = Vec::with_capacity(entries.len());
        for (qualified, payload) in entries {
            match codec.decode(&payload) {
                Ok(value) => values.push(value),
                Err(e) => {
                    warn!(key = %qualified, error = %e, "Skipping undecodable cache entry");
                }
            }
        }

        debug!(matched = values.len(), "Pattern read completed");
        Ok(values)
    }

    /// Encode and write one entry.
    ///
    /// An expiration that has already elapsed removes the key instead.
    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        app_name: &str,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> Result<(), CacheError> {
        let qualified = qualify_key(app_name, key);
        if expiration.is_elapsed(Utc::now()) {
            debug!(key = %qualified, "Expiration already elapsed, removing instead of writing");
            return self.backend.remove(&qualified).await;
        }

        let payload = self.backend.codec().encode(value)?;
        self.backend.set(&qualified, payload, expiration).await
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, app_name: &str, key: &str) -> Result<(), CacheError> {
        self.backend.remove(&qualify_key(app_name, key)).await
    }

    /// Remove every entry matching `key_pattern` in the namespace and nothing else
    #[instrument(skip(self))]
    pub async fn remove_all(&self, app_name: &str, key_pattern: &str) -> Result<usize, CacheError> {
        let removed = self
            .backend
            .remove_matching(&KeyPattern::new(app_name, key_pattern))
            .await?;
        debug!(removed, "Pattern removal completed");
        Ok(removed)
    }

    pub async fn dispose(&self) {
        self.backend.dispose().await;
    }
}

/// Build the cache backend selected in configuration.
///
/// The local backend gets a sweeper purging expired entries until `shutdown`.
#[instrument(skip(settings, shutdown), fields(backend = ?settings.backend))]
pub async fn build_cache(
    settings: &CacheSettings,
    shutdown: ShutdownSignal,
) -> Result<Cache, CacheError> {
    match settings.backend {
        CacheBackendKind::Local => {
            info!("Using in-process cache store; leases coordinate this process only");
            let store = LocalCacheStore::new();
            store.spawn_sweeper(
                Duration::from_secs(settings.sweep_interval_seconds.max(1)),
                shutdown,
            );
            Ok(store.to_cache())
        }
        CacheBackendKind::Redis => {
            let store = RedisCacheStore::connect(&settings.redis_url).await?;
            store.health_check().await?;
            Ok(Cache::new(Arc::new(store)))
        }
    }
}
