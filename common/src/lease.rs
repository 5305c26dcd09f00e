// Soft worker leases over the shared cache
//
// One cache key per worker ("{WorkerName}.Lease") holds "{hostId}|{unixMillis}".
// The read-then-write below is not atomic: two hosts claiming a vacant lease
// at the same instant can both be active for one heartbeat period, and the
// last write wins. Job bodies must tolerate that. A stricter claim (for
// example a conditional set) can be plugged in through `LeaseStore`.

use crate::cache::{Cache, Expiration};
use crate::config::WorkerConfig;
use crate::errors::CacheError;
use crate::shutdown::ShutdownSignal;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

const LEASE_KEY_SUFFIX: &str = ".Lease";
const OWNER_SEPARATOR: char = '|';

/// Cache key of a worker's lease
pub fn lease_key(worker_name: &str) -> String {
    format!("{}{}", worker_name, LEASE_KEY_SUFFIX)
}

/// Ownership claim: who holds the lease and when they last renewed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub heartbeat: DateTime<Utc>,
}

impl Lease {
    /// Heartbeats are kept at millisecond precision
    pub fn new(owner: impl Into<String>, heartbeat: DateTime<Utc>) -> Self {
        let heartbeat = Utc
            .timestamp_millis_opt(heartbeat.timestamp_millis())
            .single()
            .unwrap_or(heartbeat);
        Self {
            owner: owner.into(),
            heartbeat,
        }
    }

    /// Stored form: `"{owner}|{unix_millis}"`
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            self.owner,
            OWNER_SEPARATOR,
            self.heartbeat.timestamp_millis()
        )
    }

    /// Parse the stored form; the owner may itself contain the separator
    pub fn parse(value: &str) -> Option<Self> {
        let (owner, millis) = value.rsplit_once(OWNER_SEPARATOR)?;
        if owner.is_empty() {
            return None;
        }
        let millis: i64 = millis.trim().parse().ok()?;
        let heartbeat = Utc.timestamp_millis_opt(millis).single()?;
        Some(Self {
            owner: owner.to_string(),
            heartbeat,
        })
    }

    pub fn is_owned_by(&self, host_id: &str) -> bool {
        self.owner == host_id
    }

    /// Whether the last heartbeat is older than `threshold` at `now`
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now.signed_duration_since(self.heartbeat) > threshold
    }
}

/// Persistence of worker leases
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Current lease for the worker, if any
    async fn load(&self, worker_name: &str) -> Result<Option<Lease>, CacheError>;

    /// Write the lease, replacing whatever is stored
    async fn store(&self, worker_name: &str, lease: &Lease) -> Result<(), CacheError>;

    async fn remove(&self, worker_name: &str) -> Result<(), CacheError>;
}

/// `LeaseStore` writing plain strings through the namespaced cache
#[derive(Clone)]
pub struct CacheLeaseStore {
    cache: Cache,
    app_name: String,
}

impl CacheLeaseStore {
    pub fn new(cache: Cache, app_name: impl Into<String>) -> Self {
        Self {
            cache,
            app_name: app_name.into(),
        }
    }
}

#[async_trait]
impl LeaseStore for CacheLeaseStore {
    async fn load(&self, worker_name: &str) -> Result<Option<Lease>, CacheError> {
        let key = lease_key(worker_name);
        let Some(value) = self.cache.get::<String>(&self.app_name, &key).await? else {
            return Ok(None);
        };

        let lease = Lease::parse(&value);
        if lease.is_none() {
            warn!(key = %key, value = %value, "Ignoring malformed lease value");
        }
        Ok(lease)
    }

    async fn store(&self, worker_name: &str, lease: &Lease) -> Result<(), CacheError> {
        self.cache
            .set(
                &self.app_name,
                &lease_key(worker_name),
                &lease.encode(),
                Expiration::Never,
            )
            .await
    }

    async fn remove(&self, worker_name: &str) -> Result<(), CacheError> {
        self.cache
            .remove(&self.app_name, &lease_key(worker_name))
            .await
    }
}

/// Result of one heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Inactive,
}

/// Fresh view of who holds a worker's lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// This host holds a lease
    Owned,
    /// No live lease exists
    Vacant,
    /// Another host holds a live lease
    HeldBy(String),
    /// The lease could not be read
    Unknown,
}

impl Ownership {
    /// Whether the worker may run its job on this host
    pub fn permits_execution(&self) -> bool {
        matches!(self, Ownership::Owned | Ownership::Vacant)
    }
}

/// Per-worker lease state machine for one process
pub struct LeaseCoordinator {
    worker_name: String,
    host_id: String,
    stale_after: chrono::Duration,
    store: Arc<dyn LeaseStore>,
    active: AtomicBool,
    released: AtomicBool,
    /// Serializes heartbeats with release so nothing re-claims after it
    claim: Mutex<()>,
}

impl LeaseCoordinator {
    pub fn new(
        worker_name: impl Into<String>,
        host_id: impl Into<String>,
        stale_after: chrono::Duration,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            host_id: host_id.into(),
            stale_after,
            store,
            active: AtomicBool::new(false),
            released: AtomicBool::new(false),
            claim: Mutex::new(()),
        }
    }

    /// Coordinator using the worker's heartbeat settings
    pub fn for_worker(
        config: &WorkerConfig,
        host_id: impl Into<String>,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        Self::new(
            config.worker_name.clone(),
            host_id,
            config.stale_lease_threshold(),
            store,
        )
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// State recorded by the most recent heartbeat
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_active(&self, active: bool) {
        let was = self.active.swap(active, Ordering::SeqCst);
        if was != active {
            info!(
                worker_name = %self.worker_name,
                host_id = %self.host_id,
                active,
                "Lease state changed"
            );
        }
        telemetry::set_lease_active(&self.worker_name, active);
    }

    /// Read the lease, treating another host's stale lease as absent
    pub async fn active_lease(&self) -> Result<Option<Lease>, CacheError> {
        self.active_lease_at(Utc::now()).await
    }

    pub async fn active_lease_at(&self, now: DateTime<Utc>) -> Result<Option<Lease>, CacheError> {
        let lease = self.store.load(&self.worker_name).await?;
        Ok(lease.filter(|l| l.is_owned_by(&self.host_id) || !l.is_stale_at(now, self.stale_after)))
    }

    /// Fresh ownership check, independent of the heartbeat
    pub async fn ownership(&self) -> Ownership {
        match self.active_lease().await {
            Ok(None) => Ownership::Vacant,
            Ok(Some(lease)) if lease.is_owned_by(&self.host_id) => Ownership::Owned,
            Ok(Some(lease)) => Ownership::HeldBy(lease.owner),
            Err(e) => {
                error!(
                    worker_name = %self.worker_name,
                    host_id = %self.host_id,
                    error = %e,
                    "Failed to read lease"
                );
                Ownership::Unknown
            }
        }
    }

    /// Renew or claim the lease.
    ///
    /// A vacant lease is claimed and our own lease is renewed. Another
    /// host's live lease leaves us inactive. Another host's stale lease is
    /// removed, and the vacancy is claimed on the next heartbeat. Cache
    /// failures leave us inactive, and so does an earlier `release`.
    #[instrument(skip(self), fields(worker_name = %self.worker_name, host_id = %self.host_id))]
    pub async fn heartbeat(&self) -> LeaseState {
        self.heartbeat_at(Utc::now()).await
    }

    pub async fn heartbeat_at(&self, now: DateTime<Utc>) -> LeaseState {
        let _claim = self.claim.lock().await;
        if self.released.load(Ordering::SeqCst) {
            debug!("Lease released; heartbeat does not claim");
            self.set_active(false);
            return LeaseState::Inactive;
        }

        let state = match self.store.load(&self.worker_name).await {
            Err(e) => {
                error!(error = %e, "Heartbeat could not read lease; assuming not active");
                telemetry::record_heartbeat_failure(&self.worker_name);
                LeaseState::Inactive
            }
            Ok(None) => self.write_lease(now, "claimed").await,
            Ok(Some(lease)) if lease.is_owned_by(&self.host_id) => {
                self.write_lease(now, "renewed").await
            }
            Ok(Some(lease)) if !lease.is_stale_at(now, self.stale_after) => {
                debug!(owner = %lease.owner, "Lease held by another host");
                LeaseState::Inactive
            }
            Ok(Some(lease)) => {
                warn!(
                    owner = %lease.owner,
                    last_heartbeat = %lease.heartbeat,
                    "Dropping stale lease held by another host"
                );
                if let Err(e) = self.store.remove(&self.worker_name).await {
                    error!(error = %e, "Failed to drop stale lease");
                    telemetry::record_heartbeat_failure(&self.worker_name);
                }
                LeaseState::Inactive
            }
        };

        self.set_active(state == LeaseState::Active);
        state
    }

    async fn write_lease(&self, now: DateTime<Utc>, action: &str) -> LeaseState {
        let lease = Lease::new(self.host_id.clone(), now);
        match self.store.store(&self.worker_name, &lease).await {
            Ok(()) => {
                debug!(action, heartbeat = %lease.heartbeat, "Lease written");
                LeaseState::Active
            }
            Err(e) => {
                error!(error = %e, action, "Heartbeat could not write lease; assuming not active");
                telemetry::record_heartbeat_failure(&self.worker_name);
                LeaseState::Inactive
            }
        }
    }

    /// Give up the lease if this host holds it.
    ///
    /// The stored lease is removed only when it still names this host,
    /// whatever the last heartbeat concluded. Only the first call touches
    /// the store; later calls return false. Heartbeats after a release
    /// never claim again.
    #[instrument(skip(self), fields(worker_name = %self.worker_name, host_id = %self.host_id))]
    pub async fn release(&self) -> bool {
        let _claim = self.claim.lock().await;
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("Lease already released");
            return false;
        }
        self.set_active(false);

        match self.store.load(&self.worker_name).await {
            Ok(Some(lease)) if lease.is_owned_by(&self.host_id) => {
                match self.store.remove(&self.worker_name).await {
                    Ok(()) => {
                        info!("Lease released");
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to release lease");
                        false
                    }
                }
            }
            Ok(_) => {
                debug!("Lease no longer ours; leaving it in place");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to read lease during release");
                false
            }
        }
    }

    /// Run `heartbeat` every `period` until shutdown. The first beat is immediate.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                worker_name = %coordinator.worker_name,
                period_seconds = period.as_secs(),
                "Lease heartbeat started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.heartbeat().await;
                    }
                    _ = shutdown.cancelled() => {
                        info!(worker_name = %coordinator.worker_name, "Lease heartbeat stopped");
                        break;
                    }
                }
            }
        })
    }
}
