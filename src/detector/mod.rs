//! # Notice Detector
//! Additive heuristic scoring of whether a notice announces a new KRW listing.
//!
//! Families run over the lowercased `title + " " + body`:
//!
//! | family | points |
//! |---|---|
//! | Korean new-listing phrasing | +2, first hit only |
//! | English / French listing phrasing | +1, first hit only |
//! | KRW / 원화 pairing next to a ticker | +1 per distinct ticker |
//! | two or more distinct generic keywords | +1 |
//!
//! A notice is a listing at score ≥ 2.

pub mod extract;

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use extract::{extract_base_from_notice, is_valid_ticker, BaseExtraction, ExtractRule};

use crate::ingest::Notice;

pub const LISTING_THRESHOLD: u32 = 2;
const CONFIDENCE_SCALE: f64 = 5.0;
const LOOSE_CONFIDENCE_FLOOR: f64 = 0.3;

static RE_KO_LISTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"신규\s*(?:상장|추가|거래\s*지원)",
        r"|(?:마켓|시장)\s*(?:신규\s*)?(?:추가|상장|오픈)",
        r"|거래\s*지원\s*(?:안내|개시|시작)",
        r"|디지털\s*자산\s*(?:추가|상장)",
        r"|상장\s*(?:안내|예정|공지)",
    ))
    .expect("static regex")
});

static RE_EN_FR_LISTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\bnew\s+(?:digital\s+asset\s+)?listing",
        r"|\bwill\s+(?:list|be\s+listed)\b",
        r"|\blisting\s+(?:of|announcement|notice)\b",
        r"|\b(?:adds?|added|adding)\s+\S+\s+(?:to|on)\s+(?:the\s+)?(?:krw\s+)?market",
        r"|\btrading\s+(?:support|opens?)\s+for\b",
        r"|\bnouvelle\s+cotation\b",
        r"|\bsera\s+cot[ée]e?\b",
        r"|\bcotation\s+(?:de|du)\b",
    ))
    .expect("static regex")
});

const GENERIC_KEYWORDS: [&str; 12] = [
    "상장", "마켓", "시장", "거래", "원화", "입금", "listing", "listed", "market", "trading", "trade",
    "deposit",
];

/// Which threshold rule decides `is_listing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    #[default]
    Standard,
    /// Also requires a Korean or English/French phrasing hit.
    Strict,
    /// Score ≥ 1 suffices; confidence floored at 0.3.
    Loose,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionHits {
    pub korean: bool,
    pub english_french: bool,
    pub krw_paired: Vec<String>,
    pub generic_keywords: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub score: u32,
    pub is_listing: bool,
    pub confidence: f64,
    pub hits: DetectionHits,
}

impl Detection {
    fn rejected() -> Self {
        Self {
            score: 0,
            is_listing: false,
            confidence: 0.0,
            hits: DetectionHits::default(),
        }
    }
}

const PAIRING_CACHE_CAP: usize = 4096;

static PAIRING_CACHE: Lazy<RwLock<HashMap<String, Regex>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Compiled pairing pattern for a lowercased ticker, built once per ticker.
fn pairing_regex(ticker: &str) -> Option<Regex> {
    if let Some(re) = PAIRING_CACHE.read().get(ticker) {
        return Some(re.clone());
    }
    let t = regex::escape(ticker);
    let pattern = format!(
        r"krw[-/\s]*{t}\b|\b{t}[-/\s]*krw\b|\b{t}\)?\s*원화|원화\s*(?:마켓|시장)?\s*[:：]?\s*\(?{t}\b"
    );
    let re = Regex::new(&pattern).ok()?;
    let mut cache = PAIRING_CACHE.write();
    if cache.len() >= PAIRING_CACHE_CAP {
        cache.clear();
    }
    cache.insert(ticker.to_string(), re.clone());
    Some(re)
}

fn krw_pairing(text: &str, ticker: &str) -> bool {
    pairing_regex(&ticker.to_lowercase()).is_some_and(|re| re.is_match(text))
}

fn score(title: &str, body: &str, tickers: &[String]) -> (u32, DetectionHits) {
    let text = format!("{title} {body}").to_lowercase();
    let mut hits = DetectionHits::default();
    let mut score = 0u32;

    if RE_KO_LISTING.is_match(&text) {
        hits.korean = true;
        score += 2;
    }
    if RE_EN_FR_LISTING.is_match(&text) {
        hits.english_french = true;
        score += 1;
    }

    let distinct: BTreeSet<String> = tickers
        .iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();
    for t in distinct {
        if krw_pairing(&text, &t) {
            hits.krw_paired.push(t);
            score += 1;
        }
    }

    hits.generic_keywords = GENERIC_KEYWORDS.iter().filter(|k| text.contains(*k)).count();
    if hits.generic_keywords >= 2 {
        score += 1;
    }
    (score, hits)
}

fn confidence(score: u32) -> f64 {
    (score as f64 / CONFIDENCE_SCALE).min(1.0)
}

/// Standard rule: listing iff score ≥ 2.
pub fn detect_listing_krw(title: &str, body: &str, tickers: &[String]) -> Detection {
    if tickers.is_empty() {
        return Detection::rejected();
    }
    let (score, hits) = score(title, body, tickers);
    Detection {
        score,
        is_listing: score >= LISTING_THRESHOLD,
        confidence: confidence(score),
        hits,
    }
}

pub fn detect_listing_krw_strict(title: &str, body: &str, tickers: &[String]) -> Detection {
    let mut d = detect_listing_krw(title, body, tickers);
    d.is_listing = d.is_listing && (d.hits.korean || d.hits.english_french);
    d
}

pub fn detect_listing_krw_loose(title: &str, body: &str, tickers: &[String]) -> Detection {
    if tickers.is_empty() {
        return Detection::rejected();
    }
    let mut d = detect_listing_krw(title, body, tickers);
    d.is_listing = d.score >= 1;
    d.confidence = d.confidence.max(LOOSE_CONFIDENCE_FLOOR);
    d
}

/// Detector verdict plus the extracted base for one notice.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub detection: Detection,
    pub extraction: BaseExtraction,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoticeDetector {
    mode: DetectorMode,
}

impl NoticeDetector {
    pub fn new(mode: DetectorMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DetectorMode {
        self.mode
    }

    pub fn detect(&self, title: &str, body: &str, tickers: &[String]) -> Detection {
        match self.mode {
            DetectorMode::Standard => detect_listing_krw(title, body, tickers),
            DetectorMode::Strict => detect_listing_krw_strict(title, body, tickers),
            DetectorMode::Loose => detect_listing_krw_loose(title, body, tickers),
        }
    }

    /// Extract from the title, falling back to the body. When the source gave
    /// no tickers, the extracted base is scored as the only ticker.
    pub fn analyze(&self, notice: &Notice) -> Analysis {
        let extraction = match extract_base_from_notice(&notice.title) {
            hit @ BaseExtraction::Ticker { .. } => hit,
            BaseExtraction::Unknown { alias } => match extract_base_from_notice(&notice.body) {
                hit @ BaseExtraction::Ticker { .. } => hit,
                BaseExtraction::Unknown { alias: body_alias } => BaseExtraction::Unknown {
                    alias: alias.or(body_alias),
                },
            },
        };

        let derived;
        let tickers: &[String] = if notice.tickers.is_empty() {
            derived = extraction.base().map(|b| vec![b.to_string()]).unwrap_or_default();
            &derived
        } else {
            &notice.tickers
        };

        Analysis {
            detection: self.detect(&notice.title, &notice.body, tickers),
            extraction,
        }
    }
}
