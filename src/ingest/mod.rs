// src/ingest/mod.rs
pub mod http;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::timing::parse_trade_time_kst;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_notices_total", "Notices returned by sources.");
        describe_counter!(
            "ingest_filtered_total",
            "Notices dropped by normalization (empty title)."
        );
        describe_counter!(
            "ingest_batch_dedup_total",
            "Notices removed as repeated uids within one batch."
        );
        describe_counter!(
            "ingest_source_errors_total",
            "Source fetch/parse errors."
        );
        describe_counter!("feed_backpressure_total", "Push notices refused by a full feed channel.");
        describe_histogram!("ingest_parse_ms", "Source decode time in milliseconds.");
        describe_gauge!("ingest_last_poll_ts", "Unix ts when a source was last polled.");
    });
}

/// A notice as delivered by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notice {
    /// Source-unique id; ties on `published_at` order by it.
    #[serde(alias = "id")]
    pub uid: String,
    pub title: String,
    pub body: String,
    pub categories: Vec<String>,
    #[serde(alias = "publishedAt")]
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub tickers: Vec<String>,
    /// Explicit trade-open time, when the source provides it.
    #[serde(alias = "tradeTime")]
    pub trade_time: Option<DateTime<Utc>>,
}

impl Notice {
    /// Explicit trade time, else the first KST timestamp in title or body.
    pub fn effective_trade_time(&self) -> Option<DateTime<Utc>> {
        self.trade_time
            .or_else(|| parse_trade_time_kst(&self.title))
            .or_else(|| parse_trade_time_kst(&self.body))
    }
}

/// Upstream collaborator: anything that can hand over its latest notices.
#[async_trait]
pub trait NoticeSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<Vec<Notice>>;
    fn name(&self) -> &str;
}

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

const MAX_TEXT_CHARS: usize = 4000;

/// Normalize text: decode entities, strip tags, unify quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let decoded = html_escape::decode_html_entities(s);

    // 2) Strip HTML tags
    let mut out = RE_TAGS.replace_all(&decoded, " ").into_owned();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace (NBSP and full-width spaces included)
    let collapsed = RE_WS.replace_all(&out, " ").trim().to_string();
    out = collapsed;

    // 5) Length cap
    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

/// Normalize a raw batch: clean text, drop empty titles, drop repeated uids,
/// and order by `(published_at, uid)`. Returns (kept, filtered, deduped).
pub fn prepare_batch(raw: Vec<Notice>) -> (Vec<Notice>, usize, usize) {
    ensure_metrics_described();
    let mut filtered = 0usize;
    let mut deduped = 0usize;
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(raw.len());

    for mut n in raw {
        n.title = normalize_text(&n.title);
        n.body = normalize_text(&n.body);
        if n.title.is_empty() {
            filtered += 1;
            continue;
        }
        n.tickers = n
            .tickers
            .iter()
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
        if !n.uid.is_empty() && !seen.insert(n.uid.clone()) {
            deduped += 1;
            continue;
        }
        kept.push(n);
    }
    kept.sort_by(|a, b| (a.published_at, a.uid.as_str()).cmp(&(b.published_at, b.uid.as_str())));

    counter!("ingest_filtered_total").increment(filtered as u64);
    counter!("ingest_batch_dedup_total").increment(deduped as u64);
    (kept, filtered, deduped)
}

/// One pushed notice, tagged with the feed it came from.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub source: String,
    pub notice: Notice,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed channel full")]
    Full(Box<Notice>),
    #[error("feed channel closed")]
    Closed(Box<Notice>),
}

/// Producer half of the bounded channel between a push feed and the pipeline.
#[derive(Debug, Clone)]
pub struct FeedSender {
    source: Arc<str>,
    tx: mpsc::Sender<FeedItem>,
}

pub type FeedReceiver = mpsc::Receiver<FeedItem>;

pub fn feed_channel(source: &str, capacity: usize) -> (FeedSender, FeedReceiver) {
    ensure_metrics_described();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FeedSender {
            source: Arc::from(source),
            tx,
        },
        rx,
    )
}

impl FeedSender {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Enqueue without waiting. A full channel hands the notice back.
    pub fn try_push(&self, notice: Notice) -> std::result::Result<(), FeedError> {
        let item = FeedItem {
            source: self.source.to_string(),
            notice,
        };
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) => {
                counter!("feed_backpressure_total", "source" => self.source.to_string()).increment(1);
                FeedError::Full(Box::new(item.notice))
            }
            mpsc::error::TrySendError::Closed(item) => FeedError::Closed(Box::new(item.notice)),
        })
    }

    /// Enqueue, waiting for capacity.
    pub async fn push(&self, notice: Notice) -> std::result::Result<(), FeedError> {
        let item = FeedItem {
            source: self.source.to_string(),
            notice,
        };
        self.tx
            .send(item)
            .await
            .map_err(|e| FeedError::Closed(Box::new(e.0.notice)))
    }
}
