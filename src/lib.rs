//! Durable, cross-instance key/value cache backed by PostgreSQL.
//!
//! Entries carry sliding and/or absolute expiration, computed and enforced
//! server-side so correctness does not depend on clock sync across
//! processes. One instance among many connected to the same table is
//! elected "manager" via a Postgres advisory lock and runs the periodic
//! expired-row sweep; every instance can read, write, and refresh entries
//! regardless of its election status.
//!
//! ```no_run
//! use glacial_cache::{GlacialCacheBuilder, GlacialCacheConfig, CacheEntryOptions};
//!
//! # async fn run() -> glacial_cache::CacheResult<()> {
//! let mut config = GlacialCacheConfig::default();
//! config.connection.connection_string = "postgres://localhost/app".to_string();
//!
//! let cache = GlacialCacheBuilder::new(config).connect().await?;
//! cache.set("session:42", b"payload", CacheEntryOptions::new()).await?;
//! let value = cache.get("session:42").await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod cache;
mod cleanup;
mod config;
mod connection;
mod election;
mod error;
mod hash;
mod options;
mod resilience;
mod schema;
mod serializer;
mod sql;
mod time;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use builder::GlacialCacheBuilder;
pub use cache::{CacheEngine, CacheEntry};
pub use config::{
    CacheConfig, CircuitBreakerConfig, ConnectionConfig, ConnectionTimeouts, GlacialCacheConfig,
    InfrastructureConfig, LockConfig, MaintenanceConfig, PoolConfig, ResilienceConfig, RetryConfig,
    SerializerKind,
};
pub use connection::ConnectionSource;
pub use election::{ElectionCoordinator, ElectionEvent, LostReason};
pub use error::{CacheError, CacheResult};
pub use options::{CacheEntryOptions, NormalizedExpiration};
pub use serializer::{BinarySerializer, CustomSerializer, JsonSerializer, Serializer};
pub use time::{SystemTimeSource, TimeSource};

/// A connected handle to a PostgreSQL-backed cache table.
///
/// Cloning is cheap: all clones share the same connection pool, election
/// state, and background tasks. Dropping the last clone does not stop the
/// background tasks — call [`GlacialCache::shutdown`] for a graceful,
/// awaitable stop.
#[derive(Clone)]
pub struct GlacialCache {
    pub(crate) engine: Arc<CacheEngine>,
    pub(crate) election: ElectionCoordinator,
    pub(crate) cancellation: CancellationToken,
}

impl GlacialCache {
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.engine.get(key).await
    }

    pub async fn get_entry(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.engine.get_entry(key).await
    }

    pub async fn get_multiple(&self, keys: &[String]) -> CacheResult<Vec<CacheEntry>> {
        self.engine.get_multiple(keys).await
    }

    pub async fn set(&self, key: &str, value: &[u8], options: CacheEntryOptions) -> CacheResult<()> {
        self.engine.set(key, value, options).await
    }

    pub async fn set_multiple(
        &self,
        entries: &[(String, Vec<u8>, CacheEntryOptions)],
    ) -> CacheResult<()> {
        self.engine.set_multiple(entries).await
    }

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.engine.remove(key).await
    }

    /// Returns the number of keys that were actually present and live (P4);
    /// keys already absent or expired don't count.
    pub async fn remove_multiple(&self, keys: &[String]) -> CacheResult<u64> {
        self.engine.remove_multiple(keys).await
    }

    pub async fn refresh(&self, key: &str) -> CacheResult<()> {
        self.engine.refresh(key).await
    }

    /// Returns the number of keys actually refreshed; entries without a
    /// sliding window or already expired are no-ops and don't count (P5).
    pub async fn refresh_multiple(&self, keys: &[String]) -> CacheResult<u64> {
        self.engine.refresh_multiple(keys).await
    }

    pub async fn get_entry_typed<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        self.engine.get_entry_typed(key).await
    }

    pub async fn set_entry_typed<T>(
        &self,
        key: &str,
        value: &T,
        options: CacheEntryOptions,
    ) -> CacheResult<()>
    where
        T: serde::Serialize,
    {
        self.engine.set_entry_typed(key, value, options).await
    }

    /// Whether this instance currently holds the manager advisory lock and
    /// is therefore the one running the cleanup sweep.
    #[must_use]
    pub fn is_manager(&self) -> bool {
        self.election.is_leader()
    }

    /// Subscribes to election transitions. Joining mid-leadership does not
    /// replay the current state — check [`GlacialCache::is_manager`] first.
    pub fn subscribe_election_events(&self) -> tokio::sync::broadcast::Receiver<ElectionEvent> {
        self.election.subscribe()
    }

    /// Whether this instance's election has been permanently disabled after
    /// a `permission-denied` error on the advisory-lock primitive. Once
    /// `true`, this instance can never become manager; the condition
    /// requires an operator to grant the missing privilege and restart it.
    #[must_use]
    pub async fn is_election_disabled(&self) -> bool {
        self.election.is_disabled().await
    }

    /// Signals the election and cleanup background tasks to stop. Does not
    /// wait for them to finish; they release any held advisory lock before
    /// exiting.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }
}
