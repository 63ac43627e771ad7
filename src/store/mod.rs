//! SQLite-backed persistence for deduplication, cooldowns, watermarks,
//! the leader lock and the market catalog.
//!
//! Idempotency lives in the schema: `processed_events.event_id` is the primary
//! key and inserts go through `INSERT OR IGNORE`, so two concurrent producers
//! racing on one fingerprint resolve to exactly one `Inserted`. The connection
//! mutex only makes the handle shareable; it is not what guarantees dedup.

pub mod catalog;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identity::{
    build_event_id, canonical_markets, normalize_url, EventFingerprint, ListingEvent,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS processed_events (
    event_id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    base TEXT NOT NULL,
    url TEXT NOT NULL,
    markets TEXT NOT NULL,
    trade_time_utc INTEGER,
    raw_title TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_processed_events_created
    ON processed_events(created_at);

CREATE TABLE IF NOT EXISTS processed_bases (
    base TEXT PRIMARY KEY,
    last_acted_at INTEGER NOT NULL,
    last_event_id TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS watermarks (
    source TEXT PRIMARY KEY,
    last_published_at INTEGER NOT NULL,
    last_notice_uid TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS instance_lock (
    lock_key TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    acquired_at_utc INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS market_catalog (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    refreshed_at INTEGER NOT NULL,
    PRIMARY KEY (exchange, symbol)
) WITHOUT ROWID;
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "dedup_inserted_total",
            "Fingerprints persisted for the first time."
        );
        describe_counter!(
            "dedup_duplicate_total",
            "Fingerprints rejected by the unique constraint."
        );
        describe_counter!("cooldown_marked_total", "Bases stamped as traded.");
    });
}

/// Result of an insert-or-ignore on the fingerprint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Cumulative dedup counters for the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupTotals {
    pub inserted: u64,
    pub duplicates: u64,
}

/// Fingerprint + per-base cooldown persistence.
pub trait EventStore: Send + Sync {
    /// Insert the event's fingerprint. `Duplicate` if it was already present.
    fn try_mark_processed(&self, event: &ListingEvent) -> Result<InsertOutcome>;

    fn is_processed(&self, event_id: &EventFingerprint) -> Result<bool>;

    fn is_base_recently_traded_at(
        &self,
        base: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    fn mark_base_as_traded_at(
        &self,
        base: &str,
        event_id: &EventFingerprint,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Stamp `base` as traded unless it was stamped within `window` of `now`.
    /// Check and stamp are one statement, so of two concurrent callers at most
    /// one gets `Some`.
    fn claim_base_at(
        &self,
        base: &str,
        event_id: &EventFingerprint,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<BaseClaim>>;

    /// Undo a claim whose dispatch failed, restoring the row it displaced.
    /// A no-op if another claim has replaced it since.
    fn release_base_claim(&self, claim: &BaseClaim) -> Result<()>;

    fn dedup_totals(&self) -> DedupTotals;

    fn is_base_recently_traded(&self, base: &str, window_hours: f64) -> Result<bool> {
        let window = chrono::Duration::milliseconds((window_hours * 3_600_000.0) as i64);
        self.is_base_recently_traded_at(base, window, Utc::now())
    }

    fn mark_base_as_traded(&self, base: &str, event_id: &EventFingerprint) -> Result<()> {
        self.mark_base_as_traded_at(base, event_id, Utc::now())
    }
}

/// A held cooldown stamp, plus whatever row it overwrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseClaim {
    base: String,
    event_id: String,
    acted_at_ms: i64,
    previous: Option<(i64, String)>,
}

impl BaseClaim {
    pub fn base(&self) -> &str {
        &self.base
    }
}

/// Shared SQLite handle. Cloning shares the same connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    totals: Arc<Totals>,
}

#[derive(Default)]
struct Totals {
    inserted: AtomicU64,
    duplicates: AtomicU64,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("totals", &self.dedup_totals())
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        let store = Self::with_connection(conn)?;
        info!(target: "dedup", path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        ensure_metrics_described();
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            totals: Arc::new(Totals::default()),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Number of persisted fingerprints.
    pub fn processed_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM processed_events", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Delete fingerprints created before `cutoff`. Called by the retention job.
    pub fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM processed_events WHERE created_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        debug!(target: "dedup", removed, "purged processed events");
        Ok(removed)
    }

    fn try_mark_processed_at(
        &self,
        event: &ListingEvent,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let event_id = build_event_id(event);
        let changes = self.conn().execute(
            "INSERT OR IGNORE INTO processed_events
             (event_id, source, base, url, markets, trade_time_utc, raw_title, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event_id.as_str(),
                event.source,
                event.base.trim().to_uppercase(),
                normalize_url(&event.url),
                canonical_markets(&event.markets).join(","),
                event.trade_time_utc.map(|t| t.timestamp_millis()),
                event.raw_title,
                now.timestamp_millis(),
            ],
        )?;

        if changes > 0 {
            self.totals.inserted.fetch_add(1, Ordering::Relaxed);
            counter!("dedup_inserted_total").increment(1);
            Ok(InsertOutcome::Inserted)
        } else {
            self.totals.duplicates.fetch_add(1, Ordering::Relaxed);
            counter!("dedup_duplicate_total").increment(1);
            debug!(target: "dedup", event_id = %event_id, base = %event.base, "duplicate fingerprint");
            Ok(InsertOutcome::Duplicate)
        }
    }
}

impl EventStore for SqliteStore {
    fn try_mark_processed(&self, event: &ListingEvent) -> Result<InsertOutcome> {
        self.try_mark_processed_at(event, Utc::now())
    }

    fn is_processed(&self, event_id: &EventFingerprint) -> Result<bool> {
        let hit = self
            .conn()
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?1",
                params![event_id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    fn is_base_recently_traded_at(
        &self,
        base: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let last: Option<i64> = self
            .conn()
            .query_row(
                "SELECT last_acted_at FROM processed_bases WHERE base = ?1",
                params![base.trim().to_uppercase()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match last.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
            Some(at) => now.signed_duration_since(at) < window,
            None => false,
        })
    }

    fn mark_base_as_traded_at(
        &self,
        base: &str,
        event_id: &EventFingerprint,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO processed_bases (base, last_acted_at, last_event_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(base) DO UPDATE SET
                last_acted_at = excluded.last_acted_at,
                last_event_id = excluded.last_event_id",
            params![base.trim().to_uppercase(), now.timestamp_millis(), event_id.as_str()],
        )?;
        counter!("cooldown_marked_total").increment(1);
        Ok(())
    }

    fn claim_base_at(
        &self,
        base: &str,
        event_id: &EventFingerprint,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<BaseClaim>> {
        let base = base.trim().to_uppercase();
        let now_ms = now.timestamp_millis();
        let conn = self.conn();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let claimed = (|| -> Result<Option<BaseClaim>> {
            let previous: Option<(i64, String)> = conn
                .query_row(
                    "SELECT last_acted_at, last_event_id FROM processed_bases WHERE base = ?1",
                    params![base],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let changes = conn.execute(
                "INSERT INTO processed_bases (base, last_acted_at, last_event_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(base) DO UPDATE SET
                    last_acted_at = excluded.last_acted_at,
                    last_event_id = excluded.last_event_id
                 WHERE processed_bases.last_acted_at <= ?4",
                params![
                    base,
                    now_ms,
                    event_id.as_str(),
                    now_ms - window.num_milliseconds()
                ],
            )?;
            Ok((changes == 1).then(|| BaseClaim {
                base: base.clone(),
                event_id: event_id.as_str().to_string(),
                acted_at_ms: now_ms,
                previous,
            }))
        })();

        match claimed {
            Ok(claim) => {
                conn.execute("COMMIT", [])?;
                if claim.is_some() {
                    counter!("cooldown_marked_total").increment(1);
                } else {
                    debug!(target: "dedup", base = %base, "base already claimed in window");
                }
                Ok(claim)
            }
            Err(e) => {
                if let Err(rb) = conn.execute("ROLLBACK", []) {
                    warn!(target: "dedup", error = %rb, "cooldown claim rollback failed");
                }
                Err(e)
            }
        }
    }

    fn release_base_claim(&self, claim: &BaseClaim) -> Result<()> {
        let conn = self.conn();
        let restored = match &claim.previous {
            Some((at, id)) => conn.execute(
                "UPDATE processed_bases SET last_acted_at = ?2, last_event_id = ?3
                 WHERE base = ?1 AND last_event_id = ?4 AND last_acted_at = ?5",
                params![claim.base, at, id, claim.event_id, claim.acted_at_ms],
            )?,
            None => conn.execute(
                "DELETE FROM processed_bases
                 WHERE base = ?1 AND last_event_id = ?2 AND last_acted_at = ?3",
                params![claim.base, claim.event_id, claim.acted_at_ms],
            )?,
        };
        debug!(target: "dedup", base = %claim.base, restored, "cooldown claim released");
        Ok(())
    }

    fn dedup_totals(&self) -> DedupTotals {
        DedupTotals {
            inserted: self.totals.inserted.load(Ordering::Relaxed),
            duplicates: self.totals.duplicates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> ListingEvent {
        ListingEvent {
            source: "upbit".into(),
            base: "BIO".into(),
            url: "https://upbit.com/service_center/notice?id=1".into(),
            markets: vec!["KRW-BIO".into()],
            trade_time_utc: None,
            raw_title: "바이오 프로토콜(BIO) 원화 마켓 신규 추가".into(),
        }
    }

    #[test]
    fn second_insert_is_duplicate_and_one_row_exists() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.try_mark_processed(&listing()).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.try_mark_processed(&listing()).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.processed_count().unwrap(), 1);
        assert_eq!(
            store.dedup_totals(),
            DedupTotals {
                inserted: 1,
                duplicates: 1
            }
        );
        assert!(store.is_processed(&build_event_id(&listing())).unwrap());
    }

    #[test]
    fn cooldown_window_is_rolling() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        let id = build_event_id(&listing());
        let window = chrono::Duration::hours(24);

        assert!(!store.is_base_recently_traded_at("bio", window, t0).unwrap());
        store.mark_base_as_traded_at("bio", &id, t0).unwrap();
        assert!(store
            .is_base_recently_traded_at("BIO", window, t0 + chrono::Duration::hours(23))
            .unwrap());
        assert!(!store
            .is_base_recently_traded_at("BIO", window, t0 + chrono::Duration::hours(25))
            .unwrap());
    }

    #[test]
    fn claim_is_exclusive_inside_the_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        let window = chrono::Duration::hours(24);
        let mut other = listing();
        other.source = "upbit-ws".into();
        let (a, b) = (build_event_id(&listing()), build_event_id(&other));

        assert!(store.claim_base_at("bio", &a, window, t0).unwrap().is_some());
        assert!(store.claim_base_at("BIO", &b, window, t0).unwrap().is_none());
        assert!(store
            .claim_base_at("BIO", &b, window, t0 + chrono::Duration::hours(24))
            .unwrap()
            .is_some());
    }

    #[test]
    fn released_claim_restores_the_displaced_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        let window = chrono::Duration::hours(1);
        let id = build_event_id(&listing());

        let fresh = store.claim_base_at("BIO", &id, window, t0).unwrap().unwrap();
        store.release_base_claim(&fresh).unwrap();
        assert!(!store.is_base_recently_traded_at("BIO", window, t0).unwrap());

        store.mark_base_as_traded_at("BIO", &id, t0).unwrap();
        let later = t0 + chrono::Duration::hours(2);
        let claim = store.claim_base_at("BIO", &id, window, later).unwrap().unwrap();
        store.release_base_claim(&claim).unwrap();
        assert!(!store.is_base_recently_traded_at("BIO", window, later).unwrap());
        assert!(store
            .is_base_recently_traded_at("BIO", window, t0 + chrono::Duration::minutes(30))
            .unwrap());
    }

    #[test]
    fn purge_respects_cutoff() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.try_mark_processed_at(&listing(), old).unwrap();
        let mut fresh = listing();
        fresh.base = "TOWNS".into();
        store.try_mark_processed(&fresh).unwrap();

        let removed = store
            .purge_processed_before(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.processed_count().unwrap(), 1);
    }
}
