//! Base-ticker extraction from notice text.
//!
//! Rules run in order and the first valid candidate wins:
//! 1. `한글(TICKER)`
//! 2. `TICKER(한글)`
//! 3. `KRW-TICKER` / `TICKER-KRW`
//! 4. `TICKER 원화 마켓` / `TICKER 원화 시장`
//!
//! With no Latin candidate the result is [`BaseExtraction::Unknown`] carrying
//! the first Hangul alias found, for alias-table lookup downstream.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const QUOTE_CURRENCIES: [&str; 5] = ["KRW", "USDT", "USDC", "BTC", "USD"];

/// Hangul words that describe the notice rather than name an asset.
const NOTICE_WORDS: [&str; 14] = [
    "신규", "거래", "원화", "마켓", "시장", "추가", "상장", "안내", "공지", "디지털", "자산", "지원",
    "개시", "예정",
];

static RE_HANGUL_THEN_LATIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\p{Hangul}[\p{Hangul}\s]*?)\s*\(\s*([A-Za-z0-9][A-Za-z0-9.\-]*)\s*\)")
        .expect("static regex")
});

static RE_LATIN_THEN_HANGUL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z0-9][A-Za-z0-9.\-]*)\s*\(\s*(\p{Hangul}[\p{Hangul}\s]*?)\s*\)")
        .expect("static regex")
});

static RE_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bKRW-([A-Z0-9.]+)\b|\b([A-Z0-9.]+)-KRW\b").expect("static regex")
});

static RE_WON_MARKET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z0-9][A-Za-z0-9.\-]*)\s*원화\s*(?:마켓|시장)").expect("static regex")
});

static RE_HANGUL_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{Hangul}+").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractRule {
    HangulThenLatin,
    LatinThenHangul,
    PairToken,
    WonMarket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseExtraction {
    Ticker {
        base: String,
        alias: Option<String>,
        rule: ExtractRule,
    },
    Unknown {
        alias: Option<String>,
    },
}

impl BaseExtraction {
    pub fn base(&self) -> Option<&str> {
        match self {
            BaseExtraction::Ticker { base, .. } => Some(base),
            BaseExtraction::Unknown { .. } => None,
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            BaseExtraction::Ticker { alias, .. } | BaseExtraction::Unknown { alias } => alias.as_deref(),
        }
    }
}

/// Ticker candidate filter. Expects an already upper-cased candidate.
pub fn is_valid_ticker(candidate: &str) -> bool {
    let len = candidate.chars().count();
    if !(2..=10).contains(&len) {
        return false;
    }
    if !candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return false;
    }
    if !candidate.chars().any(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    let is_sep = |c: char| c == '.' || c == '-';
    if candidate.ends_with(is_sep) || candidate.starts_with(is_sep) {
        return false;
    }
    !QUOTE_CURRENCIES.contains(&candidate)
}

fn clean_alias(raw: &str) -> Option<String> {
    let alias = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if alias.is_empty() {
        None
    } else {
        Some(alias)
    }
}

fn first_valid<'t>(
    re: &Regex,
    text: &'t str,
    pick: impl Fn(&regex::Captures<'t>) -> Option<(&'t str, Option<&'t str>)>,
) -> Option<(String, Option<String>)> {
    re.captures_iter(text).find_map(|caps| {
        let (cand, alias) = pick(&caps)?;
        let upper = cand.to_ascii_uppercase();
        is_valid_ticker(&upper).then(|| (upper, alias.and_then(clean_alias)))
    })
}

fn first_hangul_alias(text: &str) -> Option<String> {
    RE_HANGUL_WORD
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|w| !NOTICE_WORDS.contains(w))
        .map(str::to_string)
}

pub fn extract_base_from_notice(text: &str) -> BaseExtraction {
    let ticker = |(base, alias): (String, Option<String>), rule| BaseExtraction::Ticker { base, alias, rule };

    if let Some(hit) = first_valid(&RE_HANGUL_THEN_LATIN, text, |c| {
        Some((c.get(2)?.as_str(), c.get(1).map(|m| m.as_str())))
    }) {
        return ticker(hit, ExtractRule::HangulThenLatin);
    }
    if let Some(hit) = first_valid(&RE_LATIN_THEN_HANGUL, text, |c| {
        Some((c.get(1)?.as_str(), c.get(2).map(|m| m.as_str())))
    }) {
        return ticker(hit, ExtractRule::LatinThenHangul);
    }
    if let Some(hit) = first_valid(&RE_PAIR, text, |c| {
        Some((c.get(1).or_else(|| c.get(2))?.as_str(), None))
    }) {
        return ticker(hit, ExtractRule::PairToken);
    }
    if let Some(hit) = first_valid(&RE_WON_MARKET, text, |c| Some((c.get(1)?.as_str(), None))) {
        return ticker(hit, ExtractRule::WonMarket);
    }

    BaseExtraction::Unknown {
        alias: first_hangul_alias(text),
    }
}
