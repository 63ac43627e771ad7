//! Storage for the named leader lock.
//!
//! Acquisition is a read-decide-write sequence and must run inside a single
//! serializing transaction; renew and release are single conditional writes
//! scoped to the caller's instance id.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::Result;
use crate::store::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// An open, serialized lock transaction. Dropping it without `commit`
/// discards every change.
pub trait LockTx {
    fn read(&mut self, key: &str) -> Result<Option<LockRow>>;
    fn insert(&mut self, key: &str, row: &LockRow) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
}

pub trait LockRepository: Send + Sync {
    fn begin(&self) -> Result<Box<dyn LockTx + '_>>;

    /// Bump `acquired_at` on the row held by `instance_id`. Returns rows changed.
    fn renew_lock(&self, key: &str, instance_id: &str, now: DateTime<Utc>) -> Result<usize>;

    /// Delete the row only if `instance_id` holds it. Returns rows changed.
    fn release_lock(&self, key: &str, instance_id: &str) -> Result<usize>;

    fn current(&self, key: &str) -> Result<Option<LockRow>>;
}

fn row_from_millis(instance_id: String, ms: i64) -> Option<LockRow> {
    Utc.timestamp_millis_opt(ms).single().map(|acquired_at| LockRow {
        instance_id,
        acquired_at,
    })
}

fn select_lock(conn: &Connection, key: &str) -> Result<Option<LockRow>> {
    let row = conn
        .query_row(
            "SELECT instance_id, acquired_at_utc FROM instance_lock WHERE lock_key = ?1",
            params![key],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.and_then(|(id, ms)| row_from_millis(id, ms)))
}

/// Lock table in the shared SQLite file. `BEGIN IMMEDIATE` takes the write
/// lock up front, so a second process blocks (up to the busy timeout) instead
/// of reading the same "free" state.
#[derive(Clone, Debug)]
pub struct SqliteLockRepository {
    store: SqliteStore,
}

impl SqliteLockRepository {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

struct SqliteLockTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl LockTx for SqliteLockTx<'_> {
    fn read(&mut self, key: &str) -> Result<Option<LockRow>> {
        select_lock(&self.conn, key)
    }

    fn insert(&mut self, key: &str, row: &LockRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO instance_lock (lock_key, instance_id, acquired_at_utc) VALUES (?1, ?2, ?3)",
            params![key, row.instance_id, row.acquired_at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM instance_lock WHERE lock_key = ?1", params![key])?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute("COMMIT", [])?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteLockTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute("ROLLBACK", []) {
                warn!(target: "leader", error = %e, "lock transaction rollback failed");
            }
        }
    }
}

impl LockRepository for SqliteLockRepository {
    fn begin(&self) -> Result<Box<dyn LockTx + '_>> {
        let conn = self.store.conn();
        conn.execute("BEGIN IMMEDIATE", [])?;
        Ok(Box::new(SqliteLockTx {
            conn,
            finished: false,
        }))
    }

    fn renew_lock(&self, key: &str, instance_id: &str, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.store.conn().execute(
            "UPDATE instance_lock SET acquired_at_utc = ?3 WHERE lock_key = ?1 AND instance_id = ?2",
            params![key, instance_id, now.timestamp_millis()],
        )?)
    }

    fn release_lock(&self, key: &str, instance_id: &str) -> Result<usize> {
        Ok(self.store.conn().execute(
            "DELETE FROM instance_lock WHERE lock_key = ?1 AND instance_id = ?2",
            params![key, instance_id],
        )?)
    }

    fn current(&self, key: &str) -> Result<Option<LockRow>> {
        select_lock(&self.store.conn(), key)
    }
}

/// In-process lock table. The mutex is held for the whole transaction.
#[derive(Debug, Default)]
pub struct MemoryLockRepository {
    rows: Mutex<HashMap<String, LockRow>>,
}

impl MemoryLockRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryLockTx<'a> {
    rows: MutexGuard<'a, HashMap<String, LockRow>>,
    staged: HashMap<String, LockRow>,
}

impl LockTx for MemoryLockTx<'_> {
    fn read(&mut self, key: &str) -> Result<Option<LockRow>> {
        Ok(self.staged.get(key).cloned())
    }

    fn insert(&mut self, key: &str, row: &LockRow) -> Result<()> {
        self.staged.insert(key.to_string(), row.clone());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.staged.remove(key);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        *self.rows = staged;
        Ok(())
    }
}

impl LockRepository for MemoryLockRepository {
    fn begin(&self) -> Result<Box<dyn LockTx + '_>> {
        let rows = self.rows.lock();
        let staged = rows.clone();
        Ok(Box::new(MemoryLockTx { rows, staged }))
    }

    fn renew_lock(&self, key: &str, instance_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut rows = self.rows.lock();
        match rows.get_mut(key) {
            Some(row) if row.instance_id == instance_id => {
                row.acquired_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn release_lock(&self, key: &str, instance_id: &str) -> Result<usize> {
        let mut rows = self.rows.lock();
        if rows.get(key).is_some_and(|r| r.instance_id == instance_id) {
            rows.remove(key);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn current(&self, key: &str) -> Result<Option<LockRow>> {
        Ok(self.rows.lock().get(key).cloned())
    }
}
