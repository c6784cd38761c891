//! Builds a [`GlacialCache`](crate::GlacialCache) from a
//! [`GlacialCacheConfig`], in the method-chaining style used throughout the
//! configuration layer.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::CacheEngine;
use crate::cleanup::CleanupLoop;
use crate::config::GlacialCacheConfig;
use crate::connection::ConnectionSource;
use crate::election::ElectionCoordinator;
use crate::error::CacheResult;
use crate::resilience::ResilienceExecutor;
use crate::schema::SchemaManager;
use crate::sql::SqlCommands;
use crate::time::{SystemTimeSource, TimeSource};
use crate::GlacialCache;

/// Assembles a [`GlacialCache`] from a config snapshot. Construct with
/// [`GlacialCacheBuilder::new`], chain any overrides, then call
/// [`GlacialCacheBuilder::connect`].
pub struct GlacialCacheBuilder {
    config: GlacialCacheConfig,
    time_source: Box<dyn TimeSource>,
}

impl GlacialCacheBuilder {
    #[must_use]
    pub fn new(config: GlacialCacheConfig) -> Self {
        Self {
            config,
            time_source: Box::new(SystemTimeSource),
        }
    }

    /// Overrides the time source, e.g. with a fixed clock in tests.
    #[must_use]
    pub fn with_time_source(mut self, time_source: Box<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Connects to the database, validates configuration, provisions schema
    /// infrastructure (unless `infrastructure.create_infrastructure` is
    /// `false`), and spawns the election and cleanup background tasks.
    pub async fn connect(self) -> CacheResult<GlacialCache> {
        self.config.validate()?;

        let connection = ConnectionSource::connect(&self.config.connection).await?;

        if self.config.infrastructure.create_infrastructure {
            SchemaManager::new(&connection, &self.config.cache)
                .ensure_infrastructure()
                .await?;
        }

        let commands = SqlCommands::from_cache_config(&self.config.cache);
        let resilience = ResilienceExecutor::new(self.config.resilience.clone());
        let engine = CacheEngine::new(
            connection.clone(),
            self.config.cache.clone(),
            resilience,
            self.time_source,
        );

        let election = ElectionCoordinator::new(
            connection.clone(),
            &self.config.cache.schema_name,
            &self.config.cache.table_name,
            &self.config.infrastructure,
        );

        let cancellation = CancellationToken::new();

        if self.config.infrastructure.enable_manager_election {
            let election_task = election.clone();
            let election_cancellation = cancellation.child_token();
            tokio::spawn(async move {
                election_task.run(election_cancellation).await;
            });
        }

        let cleanup = CleanupLoop::new(
            connection.clone(),
            commands,
            self.config.maintenance,
            election.clone(),
        );
        let cleanup_cancellation = cancellation.child_token();
        tokio::spawn(async move {
            cleanup.run(cleanup_cancellation).await;
        });

        info!(event = "cache_ready", "glacial cache connected and background tasks started");

        Ok(GlacialCache {
            engine: Arc::new(engine),
            election,
            cancellation,
        })
    }
}
