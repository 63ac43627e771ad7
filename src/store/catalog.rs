//! Market catalog: the set of quote-pair symbols an exchange currently lists.
//!
//! A refresh replaces the exchange's rows in a single transaction. Readers
//! see either the old set or the new set, never a half-written one.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use tracing::{info, warn};

use super::SqliteStore;
use crate::error::Result;
use crate::resilience::Guard;

/// Exchange-state lookup, e.g. the exchange's public market-list endpoint.
#[async_trait]
pub trait MarketListProvider: Send + Sync {
    async fn fetch_markets(&self) -> Result<Vec<String>>;
    fn exchange(&self) -> &str;
}

impl SqliteStore {
    /// Delete the exchange's rows and bulk-insert `symbols`, atomically.
    /// Returns the number of rows written.
    pub fn replace_market_catalog(&self, exchange: &str, symbols: &[String]) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let written = (|| -> Result<usize> {
            conn.execute(
                "DELETE FROM market_catalog WHERE exchange = ?1",
                params![exchange],
            )?;
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO market_catalog (exchange, symbol, refreshed_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            let mut n = 0usize;
            for s in symbols {
                let sym = s.trim().to_uppercase();
                if sym.is_empty() {
                    continue;
                }
                n += stmt.execute(params![exchange, sym, now])?;
            }
            Ok(n)
        })();

        match written {
            Ok(n) => {
                conn.execute("COMMIT", [])?;
                Ok(n)
            }
            Err(e) => {
                if let Err(rb) = conn.execute("ROLLBACK", []) {
                    warn!(target: "dedup", error = %rb, "catalog rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Symbols currently stored for the exchange, sorted.
    pub fn listed_markets(&self, exchange: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol FROM market_catalog WHERE exchange = ?1 ORDER BY symbol",
        )?;
        let rows = stmt.query_map(params![exchange], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

/// Fetch the exchange's market list through the resilience guard and replace
/// the stored catalog with it.
pub async fn refresh_catalog(
    guard: &Guard,
    store: &SqliteStore,
    provider: &dyn MarketListProvider,
) -> Result<usize> {
    let exchange = provider.exchange().to_string();
    let symbols = guard
        .run(&exchange, move || async move { provider.fetch_markets().await })
        .await?;
    let n = store.replace_market_catalog(&exchange, &symbols)?;
    info!(target: "dedup", exchange = %exchange, symbols = n, "market catalog refreshed");
    Ok(n)
}
