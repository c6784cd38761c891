//! Per-entry expiration options and their normalization into the bound
//! parameters the SQL layer consumes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::time::TimeSource;

/// Caller-supplied expiration policy for a single `set`/`set_multiple` entry.
///
/// Exactly one of `absolute_expiration` / `absolute_expiration_relative` may
/// be set; supplying both is an [`CacheError::InvalidArgument`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheEntryOptions {
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub absolute_expiration_relative: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
}

impl CacheEntryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    #[must_use]
    pub fn with_absolute_expiration_relative(mut self, relative: Duration) -> Self {
        self.absolute_expiration_relative = Some(relative);
        self
    }

    #[must_use]
    pub fn with_sliding_expiration(mut self, sliding: Duration) -> Self {
        self.sliding_expiration = Some(sliding);
        self
    }
}

/// The normalized form actually bound to the `Set`/`SetMultiple` statements:
/// an optional absolute instant and an optional sliding interval, both
/// already clamped to `[min_interval, max_interval]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedExpiration {
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_interval: Option<Duration>,
}

/// Normalizes caller options into bindable values, per the option-
/// normalization steps in the design: relative-takes-precedence, clamp to
/// configured bounds (logging `option_clamped` on clamp), and no
/// client-side default expiration — the server-side default is applied by
/// the SQL expression when both fields end up `None`.
pub fn normalize(
    options: &CacheEntryOptions,
    cache_config: &CacheConfig,
    time_source: &dyn TimeSource,
) -> CacheResult<NormalizedExpiration> {
    if options.absolute_expiration.is_some() && options.absolute_expiration_relative.is_some() {
        return Err(CacheError::InvalidArgument(
            "at most one of absolute_expiration and absolute_expiration_relative may be set"
                .to_string(),
        ));
    }

    let absolute_expiration = if let Some(relative) = options.absolute_expiration_relative {
        let clamped = clamp_duration(relative, cache_config, "absolute_expiration_relative");
        Some(time_source.now() + chrono_duration(clamped))
    } else {
        options.absolute_expiration
    };

    let sliding_interval = options
        .sliding_expiration
        .map(|sliding| clamp_duration(sliding, cache_config, "sliding_expiration"));

    Ok(NormalizedExpiration {
        absolute_expiration,
        sliding_interval,
    })
}

fn clamp_duration(duration: Duration, cache_config: &CacheConfig, field: &str) -> Duration {
    let clamped = duration.clamp(cache_config.min_interval, cache_config.max_interval);
    if clamped != duration {
        warn!(
            event = "option_clamped",
            field,
            requested_secs = duration.as_secs_f64(),
            clamped_secs = clamped.as_secs_f64(),
            "duration clamped to configured bounds"
        );
    }
    clamped
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FixedTimeSource;

    fn fixed_now() -> FixedTimeSource {
        FixedTimeSource(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into())
    }

    #[test]
    fn rejects_both_absolute_forms() {
        let config = CacheConfig::default();
        let opts = CacheEntryOptions::new()
            .with_absolute_expiration(Utc::now())
            .with_absolute_expiration_relative(Duration::from_secs(1));
        let err = normalize(&opts, &config, &fixed_now()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[test]
    fn relative_takes_precedence_and_resolves_via_time_source() {
        let config = CacheConfig::default();
        let now = fixed_now();
        let opts =
            CacheEntryOptions::new().with_absolute_expiration_relative(Duration::from_secs(60));
        let normalized = normalize(&opts, &config, &now).unwrap();
        assert_eq!(
            normalized.absolute_expiration,
            Some(now.0 + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn clamps_sliding_below_minimum() {
        let mut config = CacheConfig::default();
        config.min_interval = Duration::from_secs(1);
        let opts =
            CacheEntryOptions::new().with_sliding_expiration(Duration::from_millis(1));
        let normalized = normalize(&opts, &config, &fixed_now()).unwrap();
        assert_eq!(normalized.sliding_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn clamps_sliding_above_maximum() {
        let mut config = CacheConfig::default();
        config.max_interval = Duration::from_secs(10);
        let opts =
            CacheEntryOptions::new().with_sliding_expiration(Duration::from_secs(1000));
        let normalized = normalize(&opts, &config, &fixed_now()).unwrap();
        assert_eq!(normalized.sliding_interval, Some(Duration::from_secs(10)));
    }

    #[test]
    fn no_expirations_normalizes_to_all_none() {
        let config = CacheConfig::default();
        let normalized = normalize(&CacheEntryOptions::new(), &config, &fixed_now()).unwrap();
        assert_eq!(normalized.absolute_expiration, None);
        assert_eq!(normalized.sliding_interval, None);
    }
}
