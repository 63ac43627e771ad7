//! # Watermark Store
//! Per-source high-watermark gate against replay storms.
//!
//! A watermark is the highest `(published_at, uid)` pair already considered
//! for a source. Pairs compare by `published_at` first, then `uid`
//! lexicographically. The stored value never moves backwards.

use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::ingest::Notice;
use crate::store::SqliteStore;

/// Replay horizon seeded at boot, in seconds.
pub const BOOT_LOOKBACK_SECS: i64 = 5 * 60;

fn boot_lookback() -> Duration {
    Duration::seconds(BOOT_LOOKBACK_SECS)
}

/// Rows hold milliseconds; every comparison happens at that precision.
fn stored_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

fn sort_key(notice: &Notice) -> (DateTime<Utc>, &str) {
    (stored_precision(notice.published_at), notice.uid.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub last_published_at: DateTime<Utc>,
    pub last_notice_uid: String,
}

impl Watermark {
    fn key(&self) -> (DateTime<Utc>, &str) {
        (self.last_published_at, self.last_notice_uid.as_str())
    }

    fn of(notice: &Notice) -> Self {
        Self {
            last_published_at: stored_precision(notice.published_at),
            last_notice_uid: notice.uid.clone(),
        }
    }
}

/// `true` iff `(published_at, uid)` is strictly newer than `wm`.
pub fn is_newer(published_at: DateTime<Utc>, uid: &str, wm: &Watermark) -> bool {
    (stored_precision(published_at), uid) > wm.key()
}

#[derive(Clone, Debug)]
pub struct WatermarkStore {
    store: SqliteStore,
}

impl WatermarkStore {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn get(&self, source: &str) -> Result<Option<Watermark>> {
        let row = self
            .store
            .conn()
            .query_row(
                "SELECT last_published_at, last_notice_uid FROM watermarks WHERE source = ?1",
                params![source],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(ms, uid)| {
            Utc.timestamp_millis_opt(ms).single().map(|at| Watermark {
                last_published_at: at,
                last_notice_uid: uid,
            })
        }))
    }

    /// Whether the notice is past the source's watermark (or none exists).
    pub fn should_consider(&self, source: &str, notice: &Notice) -> Result<bool> {
        Ok(match self.get(source)? {
            None => true,
            Some(wm) => is_newer(notice.published_at, &notice.uid, &wm),
        })
    }

    /// Advance to the maximum pair across the whole batch, whether or not each
    /// notice passed `should_consider`. Returns the watermark now stored.
    pub fn update_from_batch(&self, source: &str, notices: &[Notice]) -> Result<Option<Watermark>> {
        let Some(max) = notices
            .iter()
            .max_by(|a, b| sort_key(a).cmp(&sort_key(b)))
            .map(Watermark::of)
        else {
            return self.get(source);
        };
        self.advance(source, max)
    }

    /// Seed `now - 5min` with an empty uid so a fresh instance skips history
    /// but still re-catches the last few minutes.
    pub fn initialize_at_boot(&self, source: &str, now: DateTime<Utc>) -> Result<Watermark> {
        let seed = Watermark {
            last_published_at: stored_precision(now - boot_lookback()),
            last_notice_uid: String::new(),
        };
        let wm = match self.advance(source, seed.clone())? {
            Some(stored) => stored,
            None => seed,
        };
        info!(
            target: "pipeline",
            source,
            published_at = %wm.last_published_at,
            "watermark initialized at boot"
        );
        Ok(wm)
    }

    /// Write `candidate` only if it is newer than the current value.
    fn advance(&self, source: &str, candidate: Watermark) -> Result<Option<Watermark>> {
        let conn = self.store.conn();
        // The WHERE clause keeps the row monotonic even with concurrent writers.
        conn.execute(
            "INSERT INTO watermarks (source, last_published_at, last_notice_uid, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source) DO UPDATE SET
                last_published_at = excluded.last_published_at,
                last_notice_uid = excluded.last_notice_uid,
                updated_at = excluded.updated_at
             WHERE excluded.last_published_at > watermarks.last_published_at
                OR (excluded.last_published_at = watermarks.last_published_at
                    AND excluded.last_notice_uid > watermarks.last_notice_uid)",
            params![
                source,
                candidate.last_published_at.timestamp_millis(),
                candidate.last_notice_uid,
                Utc::now().timestamp_millis(),
            ],
        )?;
        drop(conn);
        let current = self.get(source)?;
        debug!(target: "pipeline", source, watermark = ?current, "watermark advanced");
        Ok(current)
    }
}
