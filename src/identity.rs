//! # Event Identity
//! Content-addressed fingerprints for logical listing events.
//!
//! The same announcement reaches us through several transports (poll, push
//! feed, mirror sites) with different tracking parameters and casing. All of
//! them must hash to one fingerprint so the store's unique constraint can do
//! the deduplication.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const FIELD_DELIMITER: &str = "|";
const CANONICAL_SCHEME: &str = "https";

/// A detected listing, produced by the detector and consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEvent {
    pub source: String,
    pub base: String,
    pub url: String,
    pub markets: Vec<String>,
    pub trade_time_utc: Option<DateTime<Utc>>,
    pub raw_title: String,
}

/// Hex-encoded SHA-256 digest identifying a logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventFingerprint(String);

impl EventFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventFingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Build the fingerprint:
/// `sha256(source|BASE|normalized_url|SORTED,UPPER,MARKETS|trade_time)`.
pub fn build_event_id(event: &ListingEvent) -> EventFingerprint {
    let base = event.base.trim().to_uppercase();
    let url = normalize_url(&event.url);
    let markets = canonical_markets(&event.markets).join(",");
    let trade_time = event
        .trade_time_utc
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();

    let material = [
        event.source.trim(),
        base.as_str(),
        url.as_str(),
        markets.as_str(),
        trade_time.as_str(),
    ]
    .join(FIELD_DELIMITER);

    let digest = Sha256::digest(material.as_bytes());
    EventFingerprint(hex::encode(digest))
}

/// Canonical URL form: `https` scheme, lowercase host, no query, no fragment.
///
/// Inputs `url` cannot parse fall back to a trimmed string cut at the first
/// `?` or `#`, so noise is still stripped.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    match url::Url::parse(trimmed) {
        Ok(mut u) if u.has_host() => {
            u.set_query(None);
            u.set_fragment(None);
            if u.scheme() != CANONICAL_SCHEME {
                // `set_scheme` refuses special <-> non-special switches; rebuild instead.
                let rest = &u.as_str()[u.scheme().len()..];
                return format!("{CANONICAL_SCHEME}{rest}");
            }
            u.to_string()
        }
        _ => {
            let cut = trimmed.find(['?', '#']).unwrap_or(trimmed.len());
            trimmed[..cut].to_string()
        }
    }
}

/// Uppercased, trimmed, deduplicated and sorted market codes.
pub fn canonical_markets(markets: &[String]) -> Vec<String> {
    let mut out: Vec<String> = markets
        .iter()
        .map(|m| m.trim().to_uppercase())
        .filter(|m| !m.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(url: &str, base: &str, markets: &[&str]) -> ListingEvent {
        ListingEvent {
            source: "upbit".into(),
            base: base.into(),
            url: url.into(),
            markets: markets.iter().map(|m| m.to_string()).collect(),
            trade_time_utc: Some(Utc.with_ymd_and_hms(2025, 9, 6, 8, 0, 0).unwrap()),
            raw_title: "바이오 프로토콜(BIO) 원화 마켓 신규 추가".into(),
        }
    }

    #[test]
    fn url_noise_and_casing_do_not_change_the_fingerprint() {
        let a = event(
            "https://upbit.com/service_center/notice?id=4821&utm_source=tg#top",
            "bio",
            &["krw-bio", "BTC-BIO"],
        );
        let b = event(
            "http://UPBIT.com/service_center/notice",
            "BIO",
            &["BTC-BIO", "KRW-BIO"],
        );
        assert_eq!(build_event_id(&a), build_event_id(&b));
    }

    #[test]
    fn different_trade_time_changes_the_fingerprint() {
        let a = event("https://upbit.com/n/1", "BIO", &["KRW-BIO"]);
        let mut b = a.clone();
        b.trade_time_utc = None;
        assert_ne!(build_event_id(&a), build_event_id(&b));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let id = build_event_id(&event("https://upbit.com/n/1", "BIO", &[]));
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unparseable_url_is_still_cut_at_query() {
        assert_eq!(normalize_url("  /notice/12?ref=x#y "), "/notice/12");
        assert_eq!(normalize_url(""), "");
    }
}
