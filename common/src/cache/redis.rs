// Redis cache backend shared across processes

use super::{CacheBackend, Codec, Expiration, KeyPattern};
use crate::errors::CacheError;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Keys requested per SCAN round-trip
pub const SCAN_PAGE_SIZE: usize = 250;

const DATA_FIELD: &str = "data";
const SLIDING_FIELD: &str = "sliding_ms";
const NO_SLIDING: i64 = -1;
/// Redis rejects expirations that overflow once added to its clock
const MAX_TTL_MS: i64 = i64::MAX / 2;

/// Milliseconds of `window` as a Redis TTL argument
fn ttl_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis())
        .unwrap_or(i64::MAX)
        .min(MAX_TTL_MS)
}

/// Cache backend over a Redis server.
///
/// Every entry is a hash holding the JSON payload and its sliding window
/// (`-1` when not sliding). Absolute and relative expirations are delegated
/// to Redis key TTLs; sliding entries have their TTL re-armed on every read.
pub struct RedisCacheStore {
    client: Client,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisCacheStore {
    /// Connect to the server at `url`
    #[instrument(fields(redis_url = %url))]
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        info!("Connecting to Redis cache");

        let client = Client::open(url).map_err(|e| {
            CacheError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            CacheError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis cache connection established");
        Ok(Self {
            client,
            manager: Mutex::new(Some(manager)),
        })
    }

    fn connection(&self) -> Result<ConnectionManager, CacheError> {
        self.manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CacheError::Disposed)
    }

    /// Verify the connection with PING
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;

        if response != "PONG" {
            return Err(CacheError::Redis(format!(
                "Unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }

    /// Incrementally collect every key matching the pattern
    async fn scan(
        &self,
        conn: &mut ConnectionManager,
        pattern: &KeyPattern,
    ) -> Result<BTreeSet<String>, CacheError> {
        let glob = pattern.to_redis_match();
        let mut keys = BTreeSet::new();
        let mut cursor: u64 = 0;
        let mut round_trips = 0usize;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(conn)
                .await?;
            round_trips += 1;
            // SCAN may return a key more than once
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %glob, matched = keys.len(), round_trips, "SCAN completed");
        Ok(keys)
    }

    async fn read(
        conn: &mut ConnectionManager,
        qualified_key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let (payload, sliding_ms): (Option<Vec<u8>>, Option<i64>) = redis::cmd("HMGET")
            .arg(qualified_key)
            .arg(DATA_FIELD)
            .arg(SLIDING_FIELD)
            .query_async(conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        if let Some(window) = sliding_ms.filter(|ms| *ms > 0) {
            let _: () = redis::cmd("PEXPIRE")
                .arg(qualified_key)
                .arg(window)
                .query_async(conn)
                .await?;
        }

        Ok(Some(payload))
    }

    /// Synchronous twin of `read` over a dedicated connection
    fn read_blocking(&self, qualified_key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        // Fail the same way the async path does once disposed
        self.connection()?;
        let mut conn = self.client.get_connection()?;

        let (payload, sliding_ms): (Option<Vec<u8>>, Option<i64>) = redis::cmd("HMGET")
            .arg(qualified_key)
            .arg(DATA_FIELD)
            .arg(SLIDING_FIELD)
            .query(&mut conn)?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        if let Some(window) = sliding_ms.filter(|ms| *ms > 0) {
            let _: () = redis::cmd("PEXPIRE")
                .arg(qualified_key)
                .arg(window)
                .query(&mut conn)?;
        }

        Ok(Some(payload))
    }
}

#[async_trait]
impl CacheBackend for RedisCacheStore {
    fn codec(&self) -> Codec {
        Codec::Json
    }

    #[instrument(skip(self))]
    async fn get(&self, qualified_key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection()?;
        Self::read(&mut conn, qualified_key).await
    }

    #[instrument(skip(self))]
    fn get_blocking(&self, qualified_key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.read_blocking(qualified_key)
    }

    #[instrument(skip(self))]
    async fn get_matching(
        &self,
        pattern: &KeyPattern,
    ) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        let mut conn = self.connection()?;
        let keys = self.scan(&mut conn, pattern).await?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // Keys can expire between the scan and the read
            if let Some(payload) = Self::read(&mut conn, &key).await? {
                entries.push((key, payload));
            }
        }
        Ok(entries)
    }

    #[instrument(skip(self, payload), fields(size = payload.len()))]
    async fn set(
        &self,
        qualified_key: &str,
        payload: Vec<u8>,
        expiration: Expiration,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let sliding_ms = match expiration {
            Expiration::Sliding(window) => ttl_millis(window),
            _ => NO_SLIDING,
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(qualified_key)
            .ignore()
            .cmd("HSET")
            .arg(qualified_key)
            .arg(DATA_FIELD)
            .arg(payload)
            .arg(SLIDING_FIELD)
            .arg(sliding_ms)
            .ignore();

        match expiration {
            Expiration::Never => {}
            Expiration::At(at) => {
                pipe.cmd("PEXPIREAT")
                    .arg(qualified_key)
                    .arg(at.timestamp_millis())
                    .ignore();
            }
            Expiration::After(_) | Expiration::Sliding(_) => {
                let ttl = expiration.ttl_from(Utc::now()).unwrap_or_default();
                pipe.cmd("PEXPIRE")
                    .arg(qualified_key)
                    .arg(ttl_millis(ttl))
                    .ignore();
            }
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove(&self, qualified_key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(qualified_key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_matching(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let mut conn = self.connection()?;
        let keys: Vec<String> = self.scan(&mut conn, pattern).await?.into_iter().collect();

        let mut removed = 0usize;
        for chunk in keys.chunks(SCAN_PAGE_SIZE) {
            let deleted: i64 = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
            removed += deleted.max(0) as usize;
        }
        Ok(removed)
    }

    async fn dispose(&self) {
        let manager = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if manager.is_some() {
            info!("Redis cache connection released");
        } else {
            debug!("Redis cache already disposed");
        }
    }
}
