//! The cache engine: `get`/`set`/`remove`/`refresh` and their batch
//! counterparts, wired through the SQL builder, connection source,
//! resilience policy, and serializer table.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::Row;
use tracing::instrument;

use crate::config::{CacheConfig, SerializerKind};
use crate::connection::ConnectionSource;
use crate::error::{CacheError, CacheResult};
use crate::options::{normalize, CacheEntryOptions, NormalizedExpiration};
use crate::resilience::ResilienceExecutor;
use crate::serializer::{BinarySerializer, JsonSerializer, Serializer};
use crate::sql::SqlCommands;
use crate::time::TimeSource;

/// A row as returned by `Get`/`GetMultiple`: decoded value plus the
/// expiration metadata a caller may want (e.g. for observability).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_interval: Option<Duration>,
    pub value_type: Option<String>,
    pub value_size: i32,
    pub next_expiration: DateTime<Utc>,
}

fn pg_interval_to_duration(interval: PgInterval) -> Duration {
    let micros = interval.microseconds.max(0) as u64;
    let days_micros = (interval.days.max(0) as u64) * 86_400 * 1_000_000;
    let months_micros = (interval.months.max(0) as u64) * 30 * 86_400 * 1_000_000;
    Duration::from_micros(micros + days_micros + months_micros)
}

fn duration_to_pg_interval(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: duration.as_micros().min(i64::MAX as u128) as i64,
    }
}

/// Deduplicates a batch's keys before dispatch, keeping first-seen order.
/// Per the batching contract, duplicate input keys collapse to one
/// statement-level occurrence regardless of how many times the caller
/// repeated them.
fn dedup_keys(keys: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(keys.len());
    let mut deduped = Vec::with_capacity(keys.len());
    for key in keys {
        if seen.insert(key.as_str()) {
            deduped.push(key.clone());
        }
    }
    deduped
}

/// Deduplicates `set_multiple` entries by key, keeping the *last* occurrence
/// for a repeated key — mirroring what a loop of individual `set` calls in
/// input order would leave behind.
fn dedup_entries_keep_last(
    entries: &[(String, Vec<u8>, CacheEntryOptions)],
) -> Vec<&(String, Vec<u8>, CacheEntryOptions)> {
    let mut last_index: std::collections::HashMap<&str, usize> =
        std::collections::HashMap::with_capacity(entries.len());
    for (i, (key, _, _)) in entries.iter().enumerate() {
        last_index.insert(key.as_str(), i);
    }
    let mut indices: Vec<usize> = last_index.into_values().collect();
    indices.sort_unstable();
    indices.into_iter().map(|i| &entries[i]).collect()
}

/// Executes the eleven cache operations against one `schema.table`.
/// Cloning is cheap (`ConnectionSource` wraps a `PgPool`, which is itself an
/// `Arc`-backed handle).
pub struct CacheEngine {
    connection: ConnectionSource,
    commands: SqlCommands,
    cache_config: CacheConfig,
    resilience: ResilienceExecutor,
    time_source: Box<dyn TimeSource>,
    default_serializer_tag: &'static str,
}

impl CacheEngine {
    #[must_use]
    pub fn new(
        connection: ConnectionSource,
        cache_config: CacheConfig,
        resilience: ResilienceExecutor,
        time_source: Box<dyn TimeSource>,
    ) -> Self {
        let commands = SqlCommands::from_cache_config(&cache_config);
        let default_serializer_tag = match cache_config.serializer {
            SerializerKind::Binary => BinarySerializer.tag(),
            SerializerKind::Json => "json",
        };
        Self {
            connection,
            commands,
            cache_config,
            resilience,
            time_source,
            default_serializer_tag,
        }
    }

    fn validate_key(key: &str) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("key must not be empty".to_string()));
        }
        Ok(())
    }

    fn validate_keys(keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Err(CacheError::InvalidArgument(
                "keys must not be empty".to_string(),
            ));
        }
        for key in keys {
            Self::validate_key(key)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Self::validate_key(key)?;
        let default_interval = duration_to_pg_interval(self.cache_config.resolved_default_interval());
        self.resilience
            .execute(self.time_source.as_ref(), || async {
                let row = sqlx::query(&self.commands.get_value_only)
                    .bind(key)
                    .bind(&default_interval)
                    .fetch_optional(self.connection.pool())
                    .await
                    .map_err(CacheError::from_sqlx)?;
                Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_entry(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        Self::validate_key(key)?;
        let default_interval = duration_to_pg_interval(self.cache_config.resolved_default_interval());
        self.resilience
            .execute(self.time_source.as_ref(), || async {
                let row = sqlx::query(&self.commands.get)
                    .bind(key)
                    .bind(&default_interval)
                    .fetch_optional(self.connection.pool())
                    .await
                    .map_err(CacheError::from_sqlx)?;
                Ok(row.map(|r| Self::row_to_entry(key.to_string(), &r)))
            })
            .await
    }

    #[instrument(skip(self, keys))]
    pub async fn get_multiple(&self, keys: &[String]) -> CacheResult<Vec<CacheEntry>> {
        Self::validate_keys(keys)?;
        let deduped = dedup_keys(keys);
        let default_interval = duration_to_pg_interval(self.cache_config.resolved_default_interval());
        let chunk_size = self.cache_config.max_batch_size.max(1);

        let mut results = Vec::with_capacity(deduped.len());
        for chunk in deduped.chunks(chunk_size) {
            let rows = self
                .resilience
                .execute(self.time_source.as_ref(), || async {
                    sqlx::query(&self.commands.get_multiple)
                        .bind(chunk)
                        .bind(&default_interval)
                        .fetch_all(self.connection.pool())
                        .await
                        .map_err(CacheError::from_sqlx)
                })
                .await?;
            results.extend(rows.iter().map(|r| {
                let key: String = r.get("key");
                Self::row_to_entry(key, r)
            }));
        }
        Ok(results)
    }

    fn row_to_entry(key: String, row: &sqlx::postgres::PgRow) -> CacheEntry {
        let sliding_interval: Option<PgInterval> = row.try_get("sliding_interval").ok().flatten();
        CacheEntry {
            key,
            value: row.get("value"),
            absolute_expiration: row.try_get("absolute_expiration").ok().flatten(),
            sliding_interval: sliding_interval.map(pg_interval_to_duration),
            value_type: row.try_get("value_type").ok().flatten(),
            value_size: row.try_get("value_size").unwrap_or(0),
            next_expiration: row.get("next_expiration"),
        }
    }

    #[instrument(skip(self, value, options))]
    pub async fn set(&self, key: &str, value: &[u8], options: CacheEntryOptions) -> CacheResult<()> {
        self.set_with_tag(key, value, options, self.default_serializer_tag)
            .await
    }

    /// Shared by [`CacheEngine::set`] and [`CacheEngine::set_entry_typed`],
    /// which must record their own encoding's tag rather than always the
    /// engine's configured default.
    async fn set_with_tag(
        &self,
        key: &str,
        value: &[u8],
        options: CacheEntryOptions,
        tag: &'static str,
    ) -> CacheResult<()> {
        Self::validate_key(key)?;
        let normalized = normalize(&options, &self.cache_config, self.time_source.as_ref())?;
        let default_interval = duration_to_pg_interval(self.cache_config.resolved_default_interval());
        let sliding = normalized.sliding_interval.map(duration_to_pg_interval);
        let value_size = i32::try_from(value.len()).unwrap_or(i32::MAX);

        self.resilience
            .execute(self.time_source.as_ref(), || async {
                sqlx::query(&self.commands.set)
                    .bind(key)
                    .bind(value)
                    .bind(normalized.absolute_expiration)
                    .bind(&sliding)
                    .bind(&default_interval)
                    .bind(tag)
                    .bind(value_size)
                    .execute(self.connection.pool())
                    .await
                    .map_err(CacheError::from_sqlx)?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self, entries))]
    pub async fn set_multiple(
        &self,
        entries: &[(String, Vec<u8>, CacheEntryOptions)],
    ) -> CacheResult<()> {
        if entries.is_empty() {
            return Err(CacheError::InvalidArgument(
                "entries must not be empty".to_string(),
            ));
        }
        for (key, _, _) in entries {
            Self::validate_key(key)?;
        }

        let deduped = dedup_entries_keep_last(entries);
        let default_interval = self.cache_config.resolved_default_interval();
        let tag = self.default_serializer_tag;
        let chunk_size = self.cache_config.max_batch_size.max(1);

        for chunk in deduped.chunks(chunk_size) {
            let normalized: Vec<(String, &Vec<u8>, NormalizedExpiration)> = chunk
                .iter()
                .map(|(key, value, options)| {
                    normalize(options, &self.cache_config, self.time_source.as_ref())
                        .map(|n| (key.clone(), value, n))
                })
                .collect::<CacheResult<Vec<_>>>()?;

            let sql = self.commands.set_multiple_sql(normalized.len());
            self.resilience
                .execute(self.time_source.as_ref(), || async {
                    let mut query = sqlx::query(&sql);
                    for (key, value, normalized_expiration) in &normalized {
                        let sliding = normalized_expiration.sliding_interval.map(duration_to_pg_interval);
                        query = query
                            .bind(key.clone())
                            .bind(value.as_slice())
                            .bind(normalized_expiration.absolute_expiration)
                            .bind(sliding)
                            .bind(duration_to_pg_interval(default_interval))
                            .bind(tag)
                            .bind(i32::try_from(value.len()).unwrap_or(i32::MAX));
                    }
                    query
                        .execute(self.connection.pool())
                        .await
                        .map_err(CacheError::from_sqlx)?;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        Self::validate_key(key)?;
        self.resilience
            .execute(self.time_source.as_ref(), || async {
                sqlx::query(&self.commands.remove)
                    .bind(key)
                    .execute(self.connection.pool())
                    .await
                    .map_err(CacheError::from_sqlx)?;
                Ok(())
            })
            .await
    }

    /// Removes every key present, returning the count actually deleted
    /// (P4: `|{k : k was present and live}|`, not `keys.len()`).
    #[instrument(skip(self, keys))]
    pub async fn remove_multiple(&self, keys: &[String]) -> CacheResult<u64> {
        Self::validate_keys(keys)?;
        let deduped = dedup_keys(keys);
        let chunk_size = self.cache_config.max_batch_size.max(1);

        let mut removed = 0u64;
        for chunk in deduped.chunks(chunk_size) {
            let outcome = self
                .resilience
                .execute(self.time_source.as_ref(), || async {
                    sqlx::query(&self.commands.remove_multiple)
                        .bind(chunk)
                        .execute(self.connection.pool())
                        .await
                        .map_err(CacheError::from_sqlx)
                })
                .await?;
            removed += outcome.rows_affected();
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    pub async fn refresh(&self, key: &str) -> CacheResult<()> {
        Self::validate_key(key)?;
        let default_interval = duration_to_pg_interval(self.cache_config.resolved_default_interval());
        self.resilience
            .execute(self.time_source.as_ref(), || async {
                sqlx::query(&self.commands.refresh)
                    .bind(key)
                    .bind(&default_interval)
                    .execute(self.connection.pool())
                    .await
                    .map_err(CacheError::from_sqlx)?;
                Ok(())
            })
            .await
    }

    /// Refreshes every key with a live sliding window, returning the count
    /// actually refreshed (entries without a sliding window, or already
    /// expired, are no-ops per P5 and don't count).
    #[instrument(skip(self, keys))]
    pub async fn refresh_multiple(&self, keys: &[String]) -> CacheResult<u64> {
        Self::validate_keys(keys)?;
        let deduped = dedup_keys(keys);
        let default_interval = duration_to_pg_interval(self.cache_config.resolved_default_interval());
        let chunk_size = self.cache_config.max_batch_size.max(1);

        let mut refreshed = 0u64;
        for chunk in deduped.chunks(chunk_size) {
            let outcome = self
                .resilience
                .execute(self.time_source.as_ref(), || async {
                    sqlx::query(&self.commands.refresh_multiple)
                        .bind(chunk)
                        .bind(&default_interval)
                        .execute(self.connection.pool())
                        .await
                        .map_err(CacheError::from_sqlx)
                })
                .await?;
            refreshed += outcome.rows_affected();
        }
        Ok(refreshed)
    }

    /// Typed get using the JSON serializer, regardless of the configured
    /// default — callers reaching for a typed API opt into JSON explicitly.
    pub async fn get_entry_typed<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let serializer = JsonSerializer;
        match self.get_entry(key).await? {
            Some(entry) => Ok(Some(
                serializer.decode(&entry.value, entry.value_type.as_deref())?,
            )),
            None => Ok(None),
        }
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
        let serializer = JsonSerializer;
        let bytes = Serializer::<T>::encode(&serializer, value)?;
        let tag = Serializer::<T>::tag(&serializer);
        self.set_with_tag(key, &bytes, options, tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_interval_round_trips_sub_day_durations() {
        let original = Duration::from_secs(90);
        let interval = duration_to_pg_interval(original);
        assert_eq!(pg_interval_to_duration(interval), original);
    }

    #[test]
    fn pg_interval_accounts_for_days() {
        let interval = PgInterval {
            months: 0,
            days: 2,
            microseconds: 0,
        };
        assert_eq!(
            pg_interval_to_duration(interval),
            Duration::from_secs(2 * 86_400)
        );
    }

    #[test]
    fn validate_key_rejects_empty() {
        assert!(matches!(
            CacheEngine::validate_key(""),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn validate_keys_rejects_empty_list() {
        assert!(matches!(
            CacheEngine::validate_keys(&[]),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn dedup_keys_collapses_duplicates_preserving_first_occurrence_order() {
        let keys = vec!["a".to_string(), "b".to_string(), "a".to_string(), "c".to_string()];
        assert_eq!(dedup_keys(&keys), vec!["a", "b", "c"]);
    }

    #[test]
    fn dedup_entries_keep_last_keeps_the_later_value_for_a_repeated_key() {
        let entries = vec![
            ("a".to_string(), b"first".to_vec(), CacheEntryOptions::new()),
            ("b".to_string(), b"only".to_vec(), CacheEntryOptions::new()),
            ("a".to_string(), b"second".to_vec(), CacheEntryOptions::new()),
        ];
        let deduped = dedup_entries_keep_last(&entries);
        assert_eq!(deduped.len(), 2);
        let a = deduped.iter().find(|(k, _, _)| k == "a").unwrap();
        assert_eq!(a.1, b"second".to_vec());
    }
}
