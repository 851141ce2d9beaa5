use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Utc};
use polars::prelude::DataFrame;
use std::fmt;
use std::path::PathBuf;

use crate::config::SourceKind;
use crate::error::WelResult;
use crate::window::TimeWindow;

pub mod archive;
pub mod live;

pub use archive::ArchiveSource;
pub use live::LiveSource;

/// Power channels the logger records one sample late.
pub const SHIFTED_POWER_CHANNELS: [&str; 2] = ["HP_W", "TAH_W"];

/// A calendar month; the coverage unit of the file archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self::new(date.year(), date.month())
    }

    /// "YYYY-MM"
    pub fn parse(raw: &str) -> Option<Self> {
        NaiveDate::parse_from_str(&format!("{}-01", raw.trim()), "%Y-%m-%d")
            .ok()
            .map(Self::from_date)
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }

    /// Midnight on the first of the month in `offset`, as an instant.
    pub fn first_instant(self, offset: FixedOffset) -> DateTime<Utc> {
        offset
            .with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The month containing `instant` when read in `offset`.
    pub fn containing(instant: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self::from_date(instant.with_timezone(&offset).date_naive())
    }

    pub fn period(self, offset: FixedOffset) -> WelResult<TimeWindow> {
        TimeWindow::new(self.first_instant(offset), self.next().first_instant(offset))
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Every month touched by `window`. A zero-length window still touches the month of its start.
pub fn months_spanning(window: &TimeWindow, offset: FixedOffset) -> Vec<YearMonth> {
    let first = YearMonth::containing(window.start(), offset);
    let mut months = vec![first];
    let mut current = first.next();
    while current.first_instant(offset) < window.end() {
        months.push(current);
        current = current.next();
    }
    months
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartitionLocator {
    MonthlyFile { month: YearMonth, path: PathBuf, url: Option<String> },
    Query { table: String },
}

/// One unit of source data. Created by a source's `plan`, discarded after the merge.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionDescriptor {
    pub label: String,
    pub period: TimeWindow,
    pub locator: PartitionLocator,
    /// The period contains "now", so the source may still be appending to it
    pub open: bool,
}

/// A place partitions come from. Loading blocks the calling thread.
pub trait PartitionSource {
    fn kind(&self) -> SourceKind;

    /// Minimal list of partitions whose periods cover `window`.
    fn plan(&self, window: &TimeWindow, now: DateTime<Utc>) -> WelResult<Vec<PartitionDescriptor>>;

    /// Read one partition into the normalized frame layout, power shift applied.
    fn load(&self, partition: &PartitionDescriptor) -> WelResult<DataFrame>;

    /// Earliest instant the source is known to hold data for.
    fn earliest(&self) -> Option<DateTime<Utc>>;
}
