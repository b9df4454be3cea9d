//! Relational backend (feature `sqlite`, on by default).
//!
//! One row per bucket key. Each atomic update is a short immediate
//! transaction: take the database write lock up front (SQLite's
//! equivalent of `SELECT ... FOR UPDATE` row locking), read the row,
//! run the transition, upsert, commit. Nothing else happens inside the
//! critical section, keeping lock hold times to one round trip.
//!
//! Lock waits are bounded by the connection's busy timeout; exceeding it
//! surfaces as [`StoreError::LockTimeout`], not a hung caller. Rows carry
//! an `expires_at` stamp: reads treat stale rows as absent (reporting the
//! eviction to the observer) and [`SqliteStore::purge_expired`] deletes
//! them in bulk.
//!
//! The connection is blocking, so every operation runs on the tokio
//! blocking pool.

use crate::backend::{StateStore, UpdateFn};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::key::BucketKey;
use crate::observer::{EvictionObserver, EvictionReason, NoopObserver};
use crate::state::{BucketState, Mutation};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT_MILLIS: u64 = 5000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS bucket_state (
        key        TEXT PRIMARY KEY,
        state      TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
";

/// [`StateStore`] backed by a SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn EvictionObserver>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("conn", &"<rusqlite::Connection>")
            .finish()
    }
}

impl SqliteStore {
    /// Open (and if necessary create) the database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path).map_err(StoreError::unavailable)?)
    }

    /// Open a private in-memory database (tests, local development).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(StoreError::unavailable)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={}; {}",
            BUSY_TIMEOUT_MILLIS, SCHEMA
        ))
        .map_err(StoreError::unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
        })
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install an eviction observer.
    pub fn with_observer(mut self, observer: Arc<dyn EvictionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Delete every expired row, notifying the observer per key.
    ///
    /// Returns the number of rows reclaimed. Call this periodically; the
    /// database does not expire rows on its own.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let conn = Arc::clone(&self.conn);
        let observer = Arc::clone(&self.observer);
        let now = clamp_to_i64(self.clock.now_nanos());

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_busy("purge"))?;
            let keys: Vec<String> = {
                let mut stmt = tx
                    .prepare("SELECT key FROM bucket_state WHERE expires_at <= ?1")
                    .map_err(StoreError::unavailable)?;
                let rows = stmt
                    .query_map(params![now], |row| row.get::<_, String>(0))
                    .map_err(StoreError::unavailable)?;
                rows.collect::<Result<_, _>>().map_err(StoreError::unavailable)?
            };
            tx.execute("DELETE FROM bucket_state WHERE expires_at <= ?1", params![now])
                .map_err(StoreError::unavailable)?;
            tx.commit().map_err(StoreError::unavailable)?;

            for key in &keys {
                observer.on_eviction(&BucketKey::raw(key), EvictionReason::Expired);
            }
            Ok(keys.len())
        })
        .await
        .map_err(StoreError::unavailable)?
    }
}

fn clamp_to_i64(nanos: u64) -> i64 {
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

/// Map "database is locked/busy" onto the lock-timeout variant, anything
/// else onto `Unavailable`.
fn map_busy(key: &str) -> impl Fn(rusqlite::Error) -> StoreError + '_ {
    move |err| match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            StoreError::LockTimeout { key: key.to_string() }
        }
        _ => StoreError::unavailable(err),
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn atomic_update(
        &self,
        key: &BucketKey,
        idle_ttl: Duration,
        apply: UpdateFn,
    ) -> Result<Mutation, StoreError> {
        let conn = Arc::clone(&self.conn);
        let observer = Arc::clone(&self.observer);
        let key = key.clone();
        let now = self.clock.now_nanos();
        let ttl = u64::try_from(idle_ttl.as_nanos()).unwrap_or(u64::MAX);
        let expires_at = clamp_to_i64(now.saturating_add(ttl));

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            // Immediate: take the write lock now so the read below cannot
            // be invalidated by another writer before our upsert.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_busy(key.as_str()))?;

            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT state, expires_at FROM bucket_state WHERE key = ?1",
                    params![key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(StoreError::unavailable)?;

            let mut evicted = false;
            let current: Option<BucketState> = match row {
                Some((raw, row_expiry)) if row_expiry > clamp_to_i64(now) => {
                    Some(serde_json::from_str(&raw).map_err(StoreError::corrupt)?)
                }
                Some(_) => {
                    evicted = true;
                    None
                }
                None => None,
            };

            let mutation = apply(current);
            let payload =
                serde_json::to_string(&mutation.state).map_err(StoreError::corrupt)?;
            tx.execute(
                "INSERT INTO bucket_state (key, state, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     state = excluded.state,
                     expires_at = excluded.expires_at",
                params![key.as_str(), payload, expires_at],
            )
            .map_err(StoreError::unavailable)?;
            tx.commit().map_err(map_busy(key.as_str()))?;

            if evicted {
                observer.on_eviction(&key, EvictionReason::Expired);
            }
            Ok(mutation)
        })
        .await
        .map_err(StoreError::unavailable)?
    }
}
