//! Single-leader election via a session-scoped Postgres advisory lock.
//!
//! Exactly one running instance holds `pg_try_advisory_lock(key)` on a
//! dedicated connection at a time; that instance is the "manager" and runs
//! the cleanup loop. Followers retry acquisition with exponential backoff
//! and jitter; a leader periodically verifies it still holds the lock and
//! considers voluntarily yielding so no single instance monopolizes the
//! role forever across long-lived deployments.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{InfrastructureConfig, LockConfig};
use crate::connection::ConnectionSource;
use crate::error::CacheError;
use crate::hash::lock_key;

/// Why a leader stepped down, carried on [`ElectionEvent::Lost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    /// Verification found the advisory lock no longer held (connection
    /// reset, or the session otherwise lost it).
    LockLost,
    /// This instance released the lock itself, on `voluntary_yield_interval`.
    VoluntaryYield,
}

/// Broadcast over transitions; a subscriber joining mid-leadership does not
/// receive a replay, only subsequent transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    Elected { instance_id: Uuid, at: DateTime<Utc> },
    Lost { reason: LostReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElectionPhase {
    Follower,
    Leader,
    Disabled,
}

/// Coordinates leadership for one `schema.table`'s advisory lock key.
/// Cloning shares the same underlying state — all clones observe the same
/// `is_leader()` and the same broadcast channel.
#[derive(Clone)]
pub struct ElectionCoordinator {
    inner: Arc<ElectionState>,
}

struct ElectionState {
    connection: ConnectionSource,
    lock_key: i64,
    lock_config: LockConfig,
    is_leader: AtomicBool,
    phase: RwLock<ElectionPhase>,
    events: broadcast::Sender<ElectionEvent>,
    instance_id: Uuid,
    instance_jitter_seed: u64,
    /// Consecutive failed-acquire attempts since the last successful
    /// acquisition, driving the exponential backoff delay. Reset to zero
    /// whenever this instance becomes leader.
    attempts: AtomicU32,
    /// When this instance most recently became leader, used to trigger
    /// voluntary yield once `voluntary_yield_interval` has actually elapsed
    /// rather than a lifetime-constant per-instance coin flip.
    leader_since: Mutex<Option<Instant>>,
}

impl ElectionCoordinator {
    #[must_use]
    pub fn new(
        connection: ConnectionSource,
        schema: &str,
        table: &str,
        infrastructure: &InfrastructureConfig,
    ) -> Self {
        let (events, _receiver) = broadcast::channel(16);
        let instance_jitter_seed = rand::thread_rng().gen();
        Self {
            inner: Arc::new(ElectionState {
                connection,
                lock_key: lock_key(schema, table),
                lock_config: infrastructure.lock,
                is_leader: AtomicBool::new(false),
                phase: RwLock::new(ElectionPhase::Follower),
                events,
                instance_id: Uuid::new_v4(),
                instance_jitter_seed,
                attempts: AtomicU32::new(0),
                leader_since: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::Acquire)
    }

    /// The random identifier generated for this coordinator at construction,
    /// carried on [`ElectionEvent::Elected`] so subscribers can tell which
    /// process in the fleet just became manager.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Whether a `permission-denied` error on the lock primitive has
    /// permanently taken this instance out of the leadership cycle. Once
    /// `true`, `is_leader()` never becomes `true` again for this process.
    #[must_use]
    pub async fn is_disabled(&self) -> bool {
        *self.inner.phase.read().await == ElectionPhase::Disabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.inner.events.subscribe()
    }

    /// Runs the election loop until `cancellation` fires. Intended to be
    /// spawned as a single background task per `GlacialCache` instance.
    pub async fn run(&self, cancellation: CancellationToken) {
        let mut held_connection: Option<PoolConnection<Postgres>> = None;

        loop {
            if *self.inner.phase.read().await == ElectionPhase::Disabled {
                return;
            }

            let was_leader = held_connection.is_some();
            if was_leader {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        self.release(&mut held_connection).await;
                        return;
                    }
                    () = self.consider_voluntary_yield(&mut held_connection) => {}
                }
            } else {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        return;
                    }
                    () = self.try_acquire(&mut held_connection) => {}
                }
            }

            let delay = match (was_leader, held_connection.is_some()) {
                // Still leader after this tick: wait out the normal
                // verification interval before checking again.
                (true, true) => self.jittered(self.inner.lock_config.verification_interval),
                // Just voluntarily yielded or lost the lock: re-contend after
                // a randomized window in [0, yield_window], per the
                // voluntary-yield design rather than the acquire-failure
                // backoff (this instance isn't failing, it's cooling down).
                (true, false) => self.random_yield_window(),
                // Just became leader: first verification happens after the
                // normal interval.
                (false, true) => self.jittered(self.inner.lock_config.verification_interval),
                // Still a follower, acquire failed: back off exponentially.
                (false, false) => self.next_backoff_delay(),
            };

            tokio::select! {
                _ = cancellation.cancelled() => {
                    self.release(&mut held_connection).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_acquire(&self, held_connection: &mut Option<PoolConnection<Postgres>>) {
        let mut conn = match self.inner.connection.acquire_dedicated().await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(event = "election_acquire_connection_failed", error = %err, "could not get a connection to attempt election");
                self.inner.attempts.fetch_add(1, Ordering::AcqRel);
                return;
            }
        };

        let acquired: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.inner.lock_key)
            .fetch_one(&mut *conn)
            .await;

        match acquired {
            Ok(true) => {
                *held_connection = Some(conn);
                self.become_leader().await;
            }
            Ok(false) => {
                self.inner.attempts.fetch_add(1, Ordering::AcqRel);
            }
            Err(err) => self.handle_lock_error(err).await,
        }
    }

    /// Verifies the session still holds its advisory lock via `pg_locks`,
    /// stepping down (reason "lock-lost") if it is no longer held — e.g. the
    /// connection was reset and transparently replaced, or the verification
    /// query itself failed. If still held, rolls the voluntary-yield dice.
    async fn consider_voluntary_yield(&self, held_connection: &mut Option<PoolConnection<Postgres>>) {
        if let Some(conn) = held_connection.as_mut() {
            // There is no built-in "is this lock still mine" function; the
            // server-recommended way to check is to look the session's own
            // backend pid up in pg_locks for the advisory lock tag that
            // pg_try_advisory_lock(bigint) registers (classid/objid split
            // from the high/low 32 bits of the key, objsubid = 1 marks the
            // single-bigint-key form as opposed to the two-int32 form).
            let still_held: Result<bool, sqlx::Error> = sqlx::query_scalar(
                "SELECT EXISTS ( \
                   SELECT 1 FROM pg_locks \
                   WHERE locktype = 'advisory' \
                     AND pid = pg_backend_pid() \
                     AND classid = ($1::bigint >> 32)::int \
                     AND objid = ($1::bigint & 4294967295)::int \
                     AND objsubid = 1 \
                 )",
            )
            .bind(self.inner.lock_key)
            .fetch_one(&mut **conn)
            .await;
            match still_held {
                Ok(true) => {}
                Ok(false) => {
                    warn!(event = "manager_lock_lost", reason = "lock-lost", "advisory lock no longer held; stepping down");
                    *held_connection = None;
                    self.step_down(false).await;
                    return;
                }
                Err(_) => {
                    warn!(event = "manager_lock_lost", reason = "lock-lost", "connection holding advisory lock failed verification; stepping down");
                    *held_connection = None;
                    self.step_down(false).await;
                    return;
                }
            }
        }

        // Voluntary yield fires once this leadership tenure has actually run
        // for voluntary_yield_interval, checked every verification_interval,
        // so turnover is guaranteed rather than a per-instance coin flip
        // that (with a lifetime-constant roll) could come up "never" for
        // most instances.
        let tenure = self
            .inner
            .leader_since
            .lock()
            .expect("leader_since mutex poisoned")
            .map(|since| since.elapsed());
        if tenure.is_some_and(|t| t >= self.inner.lock_config.voluntary_yield_interval) {
            info!(event = "manager_voluntary_yield", "relinquishing leadership");
            self.release(held_connection).await;
        }
    }

    async fn become_leader(&self) {
        self.inner.attempts.store(0, Ordering::Release);
        *self
            .inner
            .leader_since
            .lock()
            .expect("leader_since mutex poisoned") = Some(Instant::now());
        *self.inner.phase.write().await = ElectionPhase::Leader;
        self.inner.is_leader.store(true, Ordering::Release);
        let at = Utc::now();
        let _ = self.inner.events.send(ElectionEvent::Elected {
            instance_id: self.inner.instance_id,
            at,
        });
        info!(event = "manager_elected", instance_id = %self.inner.instance_id, "acquired leadership");
    }

    /// Transitions Leader -> Follower without touching the held connection
    /// (already dropped by the caller, or never held). Fires `Lost` only if
    /// this instance actually was leader.
    async fn step_down(&self, voluntary: bool) {
        if self.inner.is_leader.swap(false, Ordering::AcqRel) {
            *self
                .inner
                .leader_since
                .lock()
                .expect("leader_since mutex poisoned") = None;
            *self.inner.phase.write().await = ElectionPhase::Follower;
            let reason = if voluntary {
                LostReason::VoluntaryYield
            } else {
                LostReason::LockLost
            };
            let _ = self.inner.events.send(ElectionEvent::Lost { reason });
            info!(
                event = "manager_lost",
                reason = if voluntary { "voluntary yield" } else { "lock-lost" },
                instance_id = %self.inner.instance_id,
                "relinquished leadership"
            );
        }
    }

    async fn release(&self, held_connection: &mut Option<PoolConnection<Postgres>>) {
        let voluntary = held_connection.is_some();
        if let Some(mut conn) = held_connection.take() {
            let _: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(self.inner.lock_key)
                .fetch_one(&mut *conn)
                .await;
        }
        self.step_down(voluntary).await;
    }

    /// `permission-denied` on the advisory-lock function is terminal: the
    /// role cannot call it, so every future attempt would fail identically.
    /// This instance permanently disables election and never becomes
    /// manager; cleanup the operator runs must happen through another
    /// instance or manually.
    async fn handle_lock_error(&self, err: sqlx::Error) {
        let classified = CacheError::from_sqlx(err);
        if matches!(classified, CacheError::PermissionDenied(_)) {
            error!(
                event = "election_disabled_permission_denied",
                "database role lacks privilege to use advisory locks; disabling election for this instance"
            );
            *self.inner.phase.write().await = ElectionPhase::Disabled;
            self.inner.is_leader.store(false, Ordering::Release);
        } else {
            debug!(event = "election_lock_error", error = %classified, "advisory lock attempt failed");
            self.inner.attempts.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn jittered(&self, base: std::time::Duration) -> std::time::Duration {
        jittered_duration(base, self.inner.instance_jitter_seed)
    }

    /// A randomized wait in `[0, yield_window]` before re-contending after
    /// voluntarily yielding or detecting lock loss, re-rolled each call so
    /// repeated yields don't all wait the same instance-deterministic
    /// amount.
    fn random_yield_window(&self) -> std::time::Duration {
        let fraction: f64 = rand::thread_rng().gen();
        std::time::Duration::from_secs_f64(
            fraction * self.inner.lock_config.yield_window.as_secs_f64(),
        )
    }

    /// `min(base_backoff * 2^attempts, max_backoff) ± jitter` for the
    /// current attempt count, seeded deterministically per instance so
    /// concurrent followers don't retry in lockstep.
    fn next_backoff_delay(&self) -> std::time::Duration {
        let attempts = self.inner.attempts.load(Ordering::Acquire);
        backoff_delay(
            attempts,
            self.inner.lock_config.base_backoff,
            self.inner.lock_config.max_backoff,
            self.inner.lock_config.backoff_jitter,
            self.inner.instance_jitter_seed,
        )
    }
}

/// A value in `[0, 1)` derived from a per-instance random seed. Stable for
/// the lifetime of the coordinator so repeated calls within one tick don't
/// thrash, but distinct across instances so concurrent processes don't all
/// yield/retry in lockstep.
fn unit_jitter(seed: u64) -> f64 {
    (seed % 1_000_000) as f64 / 1_000_000.0
}

fn jittered_duration(base: std::time::Duration, seed: u64) -> std::time::Duration {
    let jitter_fraction = unit_jitter(seed) * 0.2 - 0.1; // +/-10%
    let scaled = base.as_secs_f64() * (1.0 + jitter_fraction);
    std::time::Duration::from_secs_f64(scaled.max(0.0))
}

/// `min(base * 2^attempts, max) ± jitter`, clamped to be non-negative.
/// `attempts` is the count of consecutive failed acquisitions so far; the
/// first failure (`attempts == 0`) backs off by `base` alone.
fn backoff_delay(
    attempts: u32,
    base: std::time::Duration,
    max: std::time::Duration,
    jitter: std::time::Duration,
    seed: u64,
) -> std::time::Duration {
    let exponent = attempts.min(32);
    let scaled = base
        .as_secs_f64()
        .min(f64::MAX / 2.0_f64.powi(exponent as i32))
        * 2.0_f64.powi(exponent as i32);
    let capped = scaled.min(max.as_secs_f64());
    let jitter_fraction = unit_jitter(seed.wrapping_add(u64::from(attempts))) * 2.0 - 1.0; // +/-1
    let with_jitter = capped + jitter_fraction * jitter.as_secs_f64();
    std::time::Duration::from_secs_f64(with_jitter.max(0.0))
}
