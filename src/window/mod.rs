use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{WelError, WelResult};

/// Hours covered by a request that names no range at all
pub const DEFAULT_LOOKBACK_HOURS: i64 = 12;

/// Half-open interval `[start, end)` of absolute instants. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> WelResult<Self> {
        if start > end {
            return Err(WelError::InvalidWindow(format!(
                "start {} is after end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// True when `other` lies entirely inside this window.
    pub fn covers(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_ms(&self, ts_ms: i64) -> bool {
        self.start_ms() <= ts_ms && ts_ms < self.end_ms()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// One side of a requested range.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowBound {
    /// "none": the earliest (start) or latest (end) known instant
    Unbounded,
    Iso(String),
    Instant(DateTime<Utc>),
}

impl WindowBound {
    /// CLI/user text: "none" is unbounded, anything else is ISO-8601.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            WindowBound::Unbounded
        } else {
            WindowBound::Iso(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowRequest {
    /// The last twelve hours through now
    Default,
    Range(WindowBound, WindowBound),
    LastHours(f64),
}

/// Turn a request into a concrete window.
///
/// `extent` is the span of data known to exist; it backs "none" bounds. Naive ISO strings are
/// read in `tz`. Inverted requests are rejected rather than swapped.
pub fn resolve_window(
    request: &WindowRequest,
    extent: &TimeWindow,
    now: DateTime<Utc>,
    tz: Tz,
) -> WelResult<TimeWindow> {
    match request {
        WindowRequest::Default => TimeWindow::new(now - Duration::hours(DEFAULT_LOOKBACK_HOURS), now),
        WindowRequest::LastHours(hours) => {
            if !hours.is_finite() || *hours < 0.0 {
                return Err(WelError::InvalidWindow(format!("hour count {} is not a non-negative number", hours)));
            }
            let millis = (hours * 3_600_000.0).round();
            let start = (millis < i64::MAX as f64)
                .then(|| Duration::try_milliseconds(millis as i64))
                .flatten()
                .and_then(|span| now.checked_sub_signed(span))
                .ok_or_else(|| WelError::InvalidWindow(format!("{} hours reaches past the earliest representable time", hours)))?;
            TimeWindow::new(start, now)
        }
        WindowRequest::Range(start, end) => {
            let start = resolve_bound(start, extent.start(), tz)?;
            let end = resolve_bound(end, extent.end(), tz)?;
            TimeWindow::new(start, end)
        }
    }
}

fn resolve_bound(bound: &WindowBound, unbounded: DateTime<Utc>, tz: Tz) -> WelResult<DateTime<Utc>> {
    match bound {
        WindowBound::Unbounded => Ok(unbounded),
        WindowBound::Instant(instant) => Ok(*instant),
        WindowBound::Iso(text) => parse_instant(text, tz),
    }
}

/// Parse an ISO-8601 instant. Strings without an offset are local times in `tz`.
pub fn parse_instant(text: &str, tz: Tz) -> WelResult<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| WelError::InvalidWindow(format!("'{}' is not an ISO-8601 timestamp", text)))?;

    localize(naive, tz)
        .ok_or_else(|| WelError::InvalidWindow(format!("'{}' does not exist in {}", text, tz)))
}

/// Local wall-clock time to an instant. Fall-back ambiguity takes the earlier instant.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}
