//! Idempotent schema bootstrap, serialized across concurrent instances by a
//! transaction-scoped advisory lock (`pg_advisory_xact_lock`) so two
//! processes starting at once don't race on `CREATE TABLE`.

use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::connection::ConnectionSource;
use crate::error::{CacheError, CacheResult};
use crate::hash::lock_key;
use crate::sql::quote_ident;

/// Ensures the configured schema, table, and supporting index exist.
pub struct SchemaManager<'a> {
    connection: &'a ConnectionSource,
    cache_config: &'a CacheConfig,
}

impl<'a> SchemaManager<'a> {
    #[must_use]
    pub fn new(connection: &'a ConnectionSource, cache_config: &'a CacheConfig) -> Self {
        Self {
            connection,
            cache_config,
        }
    }

    /// Runs the bootstrap DDL inside one transaction, holding
    /// `pg_advisory_xact_lock(key)` for its duration so concurrent callers
    /// serialize instead of racing each other's `CREATE TABLE IF NOT
    /// EXISTS`. The lock is released automatically on commit/rollback.
    pub async fn ensure_infrastructure(&self) -> CacheResult<()> {
        let schema = &self.cache_config.schema_name;
        let table = &self.cache_config.table_name;
        let key = lock_key(schema, table);

        let mut tx = self
            .connection
            .pool()
            .begin()
            .await
            .map_err(CacheError::from_sqlx)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.classify_ddl_error(e, "acquire advisory lock"))?;

        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
        sqlx::query(&create_schema)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.classify_ddl_error(e, "create schema"))?;

        let create_table = self.create_table_ddl();
        sqlx::query(&create_table)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.classify_ddl_error(e, "create table"))?;

        let create_index = self.create_index_ddl();
        sqlx::query(&create_index)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.classify_ddl_error(e, "create index"))?;

        tx.commit().await.map_err(CacheError::from_sqlx)?;

        info!(
            event = "schema_ready",
            schema = schema.as_str(),
            table = table.as_str(),
            "cache infrastructure is present"
        );
        Ok(())
    }

    fn create_table_ddl(&self) -> String {
        let qualified = format!(
            "{}.{}",
            quote_ident(&self.cache_config.schema_name),
            quote_ident(&self.cache_config.table_name)
        );
        format!(
            "CREATE TABLE IF NOT EXISTS {t} ( \
               key TEXT PRIMARY KEY, \
               value BYTEA NOT NULL, \
               absolute_expiration TIMESTAMPTZ, \
               sliding_interval INTERVAL, \
               next_expiration TIMESTAMPTZ NOT NULL, \
               value_type TEXT, \
               value_size INTEGER NOT NULL DEFAULT 0 \
             )",
            t = qualified,
        )
    }

    fn create_index_ddl(&self) -> String {
        let index_name = format!("{}_next_expiration_idx", self.cache_config.table_name);
        let qualified_table = format!(
            "{}.{}",
            quote_ident(&self.cache_config.schema_name),
            quote_ident(&self.cache_config.table_name)
        );
        format!(
            "CREATE INDEX IF NOT EXISTS {idx} ON {t} (next_expiration)",
            idx = quote_ident(&index_name),
            t = qualified_table,
        )
    }

    /// `permission-denied` during DDL is terminal for the calling instance's
    /// bootstrap attempt: the role lacks `CREATE`, and retrying won't help.
    /// The message names the exact statement so an operator can run it by
    /// hand and set `infrastructure.create_infrastructure = false`.
    fn classify_ddl_error(&self, err: sqlx::Error, step: &str) -> CacheError {
        let classified = CacheError::from_sqlx(err);
        if let CacheError::PermissionDenied(detail) = &classified {
            warn!(
                event = "schema_permission_denied",
                step,
                "database role lacks privilege to {step}; run the DDL manually and disable \
                 infrastructure.create_infrastructure"
            );
            return CacheError::PermissionDenied(format!(
                "cannot {step} (run the corresponding DDL manually, then set \
                 infrastructure.create_infrastructure = false): {detail}"
            ));
        }
        classified
    }
}
