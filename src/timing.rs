//! # Timing Classifier
//! Pure classification of a listing's trade time relative to "now".
//!
//! A missing trade time is the risky case: treating it as live authorizes an
//! immediate dispatch on ambiguous input. That choice is therefore an explicit
//! [`MissingTradeTime`] policy rather than a silent default.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timing {
    Live,
    Future,
    Stale,
}

/// What to do when a notice carries no trade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTradeTime {
    /// Act immediately. Matches the behaviour of the listing bot this core serves.
    #[default]
    AssumeLive,
    /// Refuse to act without a trade time.
    AssumeStale,
}

/// Classify with the `AssumeLive` policy.
pub fn classify(
    trade_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    live_window: Duration,
) -> Timing {
    classify_with(trade_time, now, live_window, MissingTradeTime::AssumeLive)
}

pub fn classify_with(
    trade_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    live_window: Duration,
    missing: MissingTradeTime,
) -> Timing {
    let Some(t) = trade_time else {
        return match missing {
            MissingTradeTime::AssumeLive => Timing::Live,
            MissingTradeTime::AssumeStale => Timing::Stale,
        };
    };
    if t > now {
        Timing::Future
    } else if now.signed_duration_since(t) <= live_window {
        Timing::Live
    } else {
        Timing::Stale
    }
}

/// Classifier bound to a configured window and missing-time policy.
#[derive(Debug, Clone, Copy)]
pub struct TimingClassifier {
    pub live_window: Duration,
    pub missing: MissingTradeTime,
}

impl TimingClassifier {
    pub fn new(live_window: Duration, missing: MissingTradeTime) -> Self {
        Self { live_window, missing }
    }

    pub fn classify(&self, trade_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Timing {
        classify_with(trade_time, now, self.live_window, self.missing)
    }
}

static RE_KST_DATETIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})[-./]\s*(\d{1,2})[-./]\s*(\d{1,2})\.?\s*(?:\([^)]*\)\s*)?(\d{1,2}):(\d{2})")
        .expect("static regex")
});

/// Extract the first `YYYY-MM-DD HH:MM` style timestamp (Korean notices use
/// KST, UTC+9) and return it in UTC.
///
/// Accepts `-`, `.` or `/` separators and an optional weekday in parentheses,
/// e.g. `2025.09.06 (토) 17:00`.
pub fn parse_trade_time_kst(text: &str) -> Option<DateTime<Utc>> {
    let caps = RE_KST_DATETIME.captures(text)?;
    let num = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();

    let date = NaiveDate::from_ymd_opt(num(1)? as i32, num(2)?, num(3)?)?;
    let naive = NaiveDateTime::new(date, chrono::NaiveTime::from_hms_opt(num(4)?, num(5)?, 0)?);
    let kst = FixedOffset::east_opt(9 * 3600)?;
    let local = kst.from_local_datetime(&naive).single()?;
    Some(local.with_timezone(&Utc))
}
