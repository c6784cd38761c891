//! The connection source: an `sqlx::PgPool` wrapper configured from
//! [`ConnectionConfig`] and exposed as an immutable snapshot.
//!
//! Rebuilding the pool (on reconfiguration) produces a brand-new
//! `ConnectionSource` rather than mutating fields of an existing pool — the
//! same "new snapshot, not in-place mutation" idiom used throughout the
//! config layer.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::config::ConnectionConfig;
use crate::error::{CacheError, CacheResult};

/// Owns the pool used for every statement the cache engine issues, plus the
/// per-operation timeout applied by the resilience layer.
#[derive(Debug, Clone)]
pub struct ConnectionSource {
    pool: PgPool,
    operation_timeout: Duration,
}

impl ConnectionSource {
    /// Builds a pool from `config`, eagerly establishing at least one
    /// connection so misconfiguration (bad DSN, unreachable host,
    /// authentication failure) surfaces from `connect` rather than from the
    /// first cache operation.
    pub async fn connect(config: &ConnectionConfig) -> CacheResult<Self> {
        let mut connect_options: PgConnectOptions = config.connection_string.parse().map_err(
            |e: sqlx::Error| CacheError::InvalidArgument(format!("invalid connection string: {e}")),
        )?;
        connect_options = connect_options.application_name(&config.application_name);

        // `sqlx::PgPool` has no separate "how often does the reaper sweep
        // idle connections" knob distinct from `idle_timeout` itself — the
        // configured `pruning_interval` is accepted (so existing config
        // files from the source system still parse) but does not feed a
        // pool option; `idle_lifetime` alone governs when an idle
        // connection is eligible for closing.
        let pool = PgPoolOptions::new()
            .min_connections(config.pool.min_size)
            .max_connections(config.pool.max_size)
            .idle_timeout(Some(config.pool.idle_lifetime))
            .acquire_timeout(config.timeouts.connection)
            .connect_with(connect_options)
            .await
            .map_err(crate::error::CacheError::from_sqlx)?;

        Ok(Self {
            pool,
            operation_timeout: config.timeouts.operation,
        })
    }

    /// Builds a `ConnectionSource` around a pool the caller already
    /// constructed (e.g. one shared with other parts of the host
    /// application, or a `testcontainers`-provisioned pool in tests).
    #[must_use]
    pub fn from_pool(pool: PgPool, operation_timeout: Duration) -> Self {
        Self {
            pool,
            operation_timeout,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Acquires a single dedicated connection from the pool. Used by the
    /// election coordinator, which needs a session-scoped advisory lock held
    /// on one connection for the lifetime of its leadership.
    pub async fn acquire_dedicated(&self) -> CacheResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(crate::error::CacheError::from_sqlx)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_timeout_reflects_configured_value() {
        let config = ConnectionConfig {
            connection_string: "postgres://localhost/doesnotmatter".to_string(),
            ..Default::default()
        };
        assert_eq!(config.timeouts.operation, Duration::from_secs(30));
    }
}
