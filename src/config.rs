//! Typed, validated configuration surface.
//!
//! A [`GlacialCacheConfig`] is an immutable snapshot assembled once (from
//! defaults, a TOML file, environment variables, or manual construction) and
//! handed to [`crate::GlacialCache::connect`]. Reconfiguration is modeled as
//! building a new snapshot and a new `GlacialCache`, not as mutating fields
//! in place — see the "reactive reconfiguration" design note.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

const IDENTIFIER_PATTERN_HINT: &str = "identifiers must match ^[a-zA-Z_][a-zA-Z0-9_]*$";

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlacialCacheConfig {
    pub connection: ConnectionConfig,
    pub cache: CacheConfig,
    pub maintenance: MaintenanceConfig,
    pub resilience: ResilienceConfig,
    pub infrastructure: InfrastructureConfig,
}

impl Default for GlacialCacheConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            cache: CacheConfig::default(),
            maintenance: MaintenanceConfig::default(),
            resilience: ResilienceConfig::default(),
            infrastructure: InfrastructureConfig::default(),
        }
    }
}

impl GlacialCacheConfig {
    /// Validates identifier patterns and cross-field constraints. Called by
    /// [`crate::GlacialCache::connect`] before anything touches the network.
    pub fn validate(&self) -> CacheResult<()> {
        validate_identifier(&self.cache.schema_name)?;
        validate_identifier(&self.cache.table_name)?;
        if self.cache.min_interval > self.cache.max_interval {
            return Err(CacheError::InvalidArgument(format!(
                "cache.min_interval ({:?}) must be <= cache.max_interval ({:?})",
                self.cache.min_interval, self.cache.max_interval
            )));
        }
        if self.connection.pool.min_size > self.connection.pool.max_size {
            return Err(CacheError::InvalidArgument(format!(
                "connection.pool.min_size ({}) must be <= connection.pool.max_size ({})",
                self.connection.pool.min_size, self.connection.pool.max_size
            )));
        }
        Ok(())
    }

    /// Fully-qualified `"schema.table"` name, used to derive the advisory
    /// lock key and to build SQL identifiers.
    #[must_use]
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.cache.schema_name, self.cache.table_name)
    }
}

fn validate_identifier(identifier: &str) -> CacheResult<()> {
    let mut chars = identifier.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(CacheError::InvalidArgument(format!(
            "invalid identifier {identifier:?}: {IDENTIFIER_PATTERN_HINT}"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_string: String,
    pub pool: PoolConfig,
    pub timeouts: ConnectionTimeouts,
    pub application_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            pool: PoolConfig::default(),
            timeouts: ConnectionTimeouts::default(),
            application_name: "GlacialCache".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: u32,
    pub max_size: u32,
    #[serde(with = "humantime_serde_duration")]
    pub idle_lifetime: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub pruning_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            idle_lifetime: Duration::from_secs(10 * 60),
            pruning_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionTimeouts {
    #[serde(with = "humantime_serde_duration")]
    pub operation: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub connection: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub command: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            operation: Duration::from_secs(30),
            connection: Duration::from_secs(30),
            command: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub schema_name: String,
    pub table_name: String,
    #[serde(with = "humantime_serde_duration_opt")]
    pub default_sliding: Option<Duration>,
    #[serde(with = "humantime_serde_duration_opt")]
    pub default_absolute_relative: Option<Duration>,
    #[serde(with = "humantime_serde_duration")]
    pub min_interval: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub max_interval: Duration,
    pub serializer: SerializerKind,
    pub max_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_name: "public".to_string(),
            table_name: "glacial_cache".to_string(),
            default_sliding: None,
            default_absolute_relative: None,
            min_interval: Duration::from_millis(1),
            max_interval: Duration::from_secs(365 * 24 * 60 * 60),
            serializer: SerializerKind::Binary,
            max_batch_size: 1000,
        }
    }
}

impl CacheConfig {
    /// The default interval `D` used in the next-expiration expression when
    /// both absolute and sliding are unset. Resolves explicitly, never
    /// falls back to a hard-coded day silently (see design note on the
    /// vestigial `ELSE` branch).
    #[must_use]
    pub fn resolved_default_interval(&self) -> Duration {
        self.default_sliding
            .or(self.default_absolute_relative)
            .unwrap_or(Duration::from_secs(24 * 60 * 60))
    }
}

/// Which built-in [`crate::serializer::Serializer`] a `GlacialCache` selects
/// when the caller does not supply a custom one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SerializerKind {
    Binary,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enable_automatic_cleanup: bool,
    #[serde(with = "humantime_serde_duration")]
    pub cleanup_interval: Duration,
    pub max_cleanup_batch_size: i64,
    pub max_chunks_per_run: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enable_automatic_cleanup: true,
            cleanup_interval: Duration::from_secs(5 * 60),
            max_cleanup_batch_size: 10_000,
            max_chunks_per_run: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub enable: bool,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(with = "humantime_serde_duration")]
    pub operation_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enable: true,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde_duration")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enable: bool,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde_duration")]
    pub duration_of_break: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            failure_threshold: 5,
            duration_of_break: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureConfig {
    pub create_infrastructure: bool,
    pub enable_manager_election: bool,
    pub lock: LockConfig,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            create_infrastructure: true,
            enable_manager_election: true,
            lock: LockConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(with = "humantime_serde_duration")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub verification_interval: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub voluntary_yield_interval: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub yield_window: Duration,
    /// Base delay for the follower's acquire-failure backoff: `min(base *
    /// 2^attempts, max) ± jitter`.
    #[serde(with = "humantime_serde_duration")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub max_backoff: Duration,
    #[serde(with = "humantime_serde_duration")]
    pub backoff_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            verification_interval: Duration::from_secs(30),
            voluntary_yield_interval: Duration::from_secs(5 * 60),
            yield_window: Duration::from_secs(5),
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_jitter: Duration::from_secs(1),
        }
    }
}

/// Minimal `humantime`-free duration (de)serialization as seconds, kept
/// dependency-light: config files use plain fractional seconds (`30`,
/// `0.001`) rather than a `"30s"` shorthand.
mod humantime_serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

mod humantime_serde_duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        Ok(secs.map(|s| Duration::from_secs_f64(s.max(0.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        GlacialCacheConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_invalid_schema_name() {
        let mut config = GlacialCacheConfig::default();
        config.cache.schema_name = "1bad".to_string();
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_invalid_table_name() {
        let mut config = GlacialCacheConfig::default();
        config.cache.table_name = "bad-name".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_interval_bounds() {
        let mut config = GlacialCacheConfig::default();
        config.cache.min_interval = Duration::from_secs(100);
        config.cache.max_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn qualified_table_joins_schema_and_table() {
        let config = GlacialCacheConfig::default();
        assert_eq!(config.qualified_table(), "public.glacial_cache");
    }

    #[test]
    fn resolved_default_interval_prefers_sliding_then_absolute_then_day() {
        let mut config = CacheConfig::default();
        assert_eq!(
            config.resolved_default_interval(),
            Duration::from_secs(24 * 60 * 60)
        );
        config.default_absolute_relative = Some(Duration::from_secs(60));
        assert_eq!(config.resolved_default_interval(), Duration::from_secs(60));
        config.default_sliding = Some(Duration::from_secs(30));
        assert_eq!(config.resolved_default_interval(), Duration::from_secs(30));
    }
}
