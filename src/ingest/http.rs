use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use tracing::warn;

use super::{ensure_metrics_described, Notice, NoticeSource};
use crate::error::{CoreError, Result};
use crate::store::catalog::MarketListProvider;

/// Polls a URL that returns a JSON array of notices.
///
/// The body may also be an object with a `notices` or `data` array, which is
/// what most exchange notice endpoints wrap their lists in.
pub struct JsonNoticeSource {
    name: String,
    url: String,
    client: reqwest::Client,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum Envelope {
    Bare(Vec<Notice>),
    Notices { notices: Vec<Notice> },
    Data { data: Vec<Notice> },
}

impl Envelope {
    fn into_notices(self) -> Vec<Notice> {
        match self {
            Envelope::Bare(v) | Envelope::Notices { notices: v } | Envelope::Data { data: v } => v,
        }
    }
}

impl JsonNoticeSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("listing-radar/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(name, url, client))
    }

    pub fn with_client(
        name: impl Into<String>,
        url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        ensure_metrics_described();
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Decode a response body. Exposed for fixtures.
    pub fn parse_body(body: &str) -> Result<Vec<Notice>> {
        let t0 = Instant::now();
        let env: Envelope = serde_json::from_str(body)
            .map_err(|e| CoreError::PermanentValidation(format!("notice json: {e}")))?;
        let out = env.into_notices();
        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(out)
    }
}

#[async_trait]
impl NoticeSource for JsonNoticeSource {
    async fn fetch_latest(&self) -> Result<Vec<Notice>> {
        let resp = match self.client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "pipeline", error = %e, source = %self.name, "source http error");
                counter!("ingest_source_errors_total", "source" => self.name.clone()).increment(1);
                return Err(e.into());
            }
        };
        let body = resp.error_for_status()?.text().await?;
        let notices = Self::parse_body(&body).inspect_err(|_| {
            counter!("ingest_source_errors_total", "source" => self.name.clone()).increment(1);
        })?;

        counter!("ingest_notices_total", "source" => self.name.clone()).increment(notices.len() as u64);
        gauge!("ingest_last_poll_ts", "source" => self.name.clone())
            .set(chrono::Utc::now().timestamp() as f64);
        Ok(notices)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Reads an exchange's market list, e.g. Upbit's `/v1/market/all`.
pub struct JsonMarketListProvider {
    exchange: String,
    url: String,
    client: reqwest::Client,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum MarketEntry {
    Symbol(String),
    Market {
        #[serde(alias = "symbol")]
        market: String,
    },
}

impl JsonMarketListProvider {
    pub fn new(
        exchange: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("listing-radar/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            exchange: exchange.into(),
            url: url.into(),
            client,
        })
    }

    /// Accepts `["KRW-BTC", ...]` or `[{"market": "KRW-BTC", ...}, ...]`.
    pub fn parse_markets(body: &str) -> Result<Vec<String>> {
        let entries: Vec<MarketEntry> = serde_json::from_str(body)
            .map_err(|e| CoreError::PermanentValidation(format!("market list json: {e}")))?;
        Ok(entries
            .into_iter()
            .map(|e| match e {
                MarketEntry::Symbol(s) | MarketEntry::Market { market: s } => s,
            })
            .collect())
    }
}

#[async_trait]
impl MarketListProvider for JsonMarketListProvider {
    async fn fetch_markets(&self) -> Result<Vec<String>> {
        let resp = self.client.get(&self.url).send().await?;
        let body = resp.error_for_status()?.text().await?;
        Self::parse_markets(&body)
    }

    fn exchange(&self) -> &str {
        &self.exchange
    }
}
