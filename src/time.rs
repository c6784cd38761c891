//! Client-side time source, used for option normalization and backoff
//! scheduling. The actual expiration comparisons always happen against the
//! server's `now()` inside the SQL statements in [`crate::sql`]; this trait
//! only covers math the client must do before a statement is sent (e.g.
//! turning a relative duration into an absolute timestamp).

use chrono::{DateTime, Utc};

/// Supplies the current wall-clock instant. Substitutable with a fixed clock
/// in tests so option-normalization logic is deterministic.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The default time source, backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fixed clock for deterministic unit tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource(pub DateTime<Utc>);

#[cfg(test)]
impl TimeSource for FixedTimeSource {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
