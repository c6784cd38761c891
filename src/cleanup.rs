//! Background expiration sweep. Runs only while the election coordinator
//! reports this instance as the elected manager, so exactly one instance
//! deletes expired rows at a time.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MaintenanceConfig;
use crate::connection::ConnectionSource;
use crate::election::ElectionCoordinator;
use crate::error::CacheError;
use crate::sql::SqlCommands;

/// Drives the periodic `CleanupExpired` sweep.
pub struct CleanupLoop {
    connection: ConnectionSource,
    commands: SqlCommands,
    maintenance: MaintenanceConfig,
    election: ElectionCoordinator,
}

impl CleanupLoop {
    #[must_use]
    pub fn new(
        connection: ConnectionSource,
        commands: SqlCommands,
        maintenance: MaintenanceConfig,
        election: ElectionCoordinator,
    ) -> Self {
        Self {
            connection,
            commands,
            maintenance,
            election,
        }
    }

    /// Runs until `cancellation` fires. Intended to be spawned as a single
    /// background task per `GlacialCache` instance; a no-op loop body when
    /// `enable_automatic_cleanup` is `false` still respects cancellation so
    /// the handle always shuts down promptly.
    pub async fn run(&self, cancellation: CancellationToken) {
        if !self.maintenance.enable_automatic_cleanup {
            cancellation.cancelled().await;
            return;
        }

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = tokio::time::sleep(self.maintenance.cleanup_interval) => {}
            }

            if !self.election.is_leader() {
                info!(event = "cleanup_skipped_not_leader", "not the elected manager; skipping sweep");
                continue;
            }

            self.run_once().await;
        }
    }

    /// Runs one sweep: up to `max_chunks_per_run` chunked deletes of at most
    /// `max_cleanup_batch_size` rows each. Chunking avoids a single
    /// long-running statement holding locks over a large expired backlog;
    /// the cap on chunk count bounds one sweep's total work even if the
    /// backlog is enormous, leaving the remainder for the next interval.
    pub async fn run_once(&self) {
        let now = Utc::now();
        let mut total_deleted: u64 = 0;

        for chunk in 0..self.maintenance.max_chunks_per_run {
            let result = sqlx::query(&self.commands.cleanup_expired)
                .bind(now)
                .bind(self.maintenance.max_cleanup_batch_size)
                .execute(self.connection.pool())
                .await;

            match result {
                Ok(outcome) => {
                    let deleted = outcome.rows_affected();
                    total_deleted += deleted;
                    if deleted < self.maintenance.max_cleanup_batch_size as u64 {
                        info!(
                            event = "cleanup_completed",
                            rows_deleted = total_deleted,
                            chunks = chunk + 1,
                            "cleanup sweep finished, backlog drained"
                        );
                        return;
                    }
                }
                Err(err) => {
                    let classified = CacheError::from_sqlx(err);
                    warn!(event = "cleanup_failed", error = %classified, "cleanup sweep failed");
                    return;
                }
            }
        }

        warn!(
            event = "cleanup_batch_cap_hit",
            rows_deleted = total_deleted,
            max_chunks_per_run = self.maintenance.max_chunks_per_run,
            "cleanup sweep hit its chunk cap; backlog may remain for the next interval"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_defaults_enable_automatic_cleanup() {
        assert!(MaintenanceConfig::default().enable_automatic_cleanup);
    }
}
