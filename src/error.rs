//! Error taxonomy for the cache engine, election coordinator, and schema manager.
//!
//! Each variant corresponds to one of the error *kinds* described in the
//! design: callers match on kind, not on the underlying `sqlx` error, so the
//! backing driver can evolve without breaking consumers.

use thiserror::Error;

/// Errors surfaced by [`crate::cache::CacheEngine`], [`crate::schema::SchemaManager`],
/// and the election coordinator.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Caller supplied contradictory or malformed input (empty key, both
    /// absolute-expiration forms set, an identifier that fails validation).
    /// Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A transient database fault (connection reset, serialization failure,
    /// detected deadlock). Eligible for retry under the resilience policy.
    #[error("transient database error: {0}")]
    TransientIo(#[source] sqlx::Error),

    /// The per-operation timeout elapsed, including any retries attempted
    /// within it.
    #[error("operation timed out")]
    Timeout,

    /// The circuit breaker is open and refused to dispatch the operation.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// The database role lacks a required privilege (schema DDL, or the
    /// advisory-lock functions). Surfaced once with an actionable message;
    /// the affected subsystem disables itself rather than retrying forever.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The serializer could not decode `value` as the requested type, or the
    /// stored `value_type` tag did not match. Never conflated with a miss.
    #[error("failed to decode cached value: {0}")]
    DecodeError(String),

    /// The caller's cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    /// Whether the resilience policy is allowed to retry an operation that
    /// failed with this error. Only transient-io and timeout are eligible;
    /// everything else is either a caller bug or a fault that retrying
    /// cannot fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Timeout)
    }

    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("42501") {
                    return Self::PermissionDenied(db_err.message().to_string());
                }
                Self::TransientIo(err)
            }
            _ => Self::TransientIo(err),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;
