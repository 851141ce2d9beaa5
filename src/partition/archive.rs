use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use polars::prelude::DataFrame;
use reqwest::blocking::Client;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    months_spanning, PartitionDescriptor, PartitionLocator, PartitionSource, YearMonth,
    SHIFTED_POWER_CHANNELS,
};
use crate::config::{Config, SourceKind};
use crate::error::{WelError, WelResult};
use crate::frame;
use crate::window::TimeWindow;

const DATE_COLUMN: &str = "Date";
const TIME_COLUMN: &str = "Time";
const DATE_FORMAT: &str = "%m/%d/%Y";
const TIME_FORMATS: [&str; 2] = ["%H:%M:%S", "%H:%M"];

/// Monthly CSV exports kept in a local cache directory and fetched from the logger's web endpoint
/// when missing.
pub struct ArchiveSource {
    cache_dir: PathBuf,
    endpoint_template: String,
    source_offset: FixedOffset,
    start: YearMonth,
    client: Client,
}

impl ArchiveSource {
    pub fn new(config: &Config) -> WelResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .map_err(|e| WelError::Config(format!("failed to build HTTP client: {}", e)))?;

        info!(
            "Archive source: cache {} (offset {})",
            config.cache_dir.display(),
            config.source_utc_offset
        );

        Ok(Self {
            cache_dir: config.cache_dir.clone(),
            endpoint_template: config.endpoint_template.clone(),
            source_offset: config.source_offset()?,
            start: config.archive_start_month()?,
            client,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache path of one month, e.g. `wel_cache/2019-11.csv`
    pub fn month_path(&self, month: YearMonth) -> PathBuf {
        self.cache_dir.join(format!("{}.csv", month))
    }

    /// Remote URL of one month, or `None` when no endpoint is configured.
    pub fn month_url(&self, month: YearMonth) -> Option<String> {
        let template = self.endpoint_template.trim();
        if template.is_empty() {
            return None;
        }
        Some(
            template
                .replace("{year}", &format!("{:04}", month.year))
                .replace("{month}", &format!("{:02}", month.month)),
        )
    }

    /// Make sure a month is in the cache, downloading when absent or when `refresh` is set.
    /// A cached copy is kept when a refresh cannot be downloaded.
    pub fn fetch_month(&self, month: YearMonth, refresh: bool) -> WelResult<PathBuf> {
        let path = self.month_path(month);
        let cached = path.exists();
        if cached && !refresh {
            debug!("Cache hit for {}: {}", month, path.display());
            return Ok(path);
        }

        let Some(url) = self.month_url(month) else {
            if cached {
                warn!("No endpoint configured, using cached {} as is", path.display());
                return Ok(path);
            }
            return Err(WelError::partition(month.to_string(), "not cached and no endpoint configured"));
        };
        match self.download(&url, &path) {
            Ok(()) => Ok(path),
            Err(reason) if cached => {
                warn!("Refresh of {} failed ({}), using cached {}", month, reason, path.display());
                Ok(path)
            }
            Err(reason) => Err(WelError::partition(month.to_string(), reason)),
        }
    }

    /// Populate the cache for an inclusive month range, with a progress bar.
    pub fn fetch_range(&self, from: YearMonth, to: YearMonth, refresh: bool) -> WelResult<Vec<PathBuf>> {
        let mut months = Vec::new();
        let mut current = from;
        while current <= to {
            months.push(current);
            current = current.next();
        }

        let progress = create_progress_bar(months.len() as u64, "months");
        let mut paths = Vec::with_capacity(months.len());
        for month in months {
            progress.set_message(month.to_string());
            paths.push(self.fetch_month(month, refresh)?);
            progress.inc(1);
        }
        progress.finish_with_message("Downloads completed");

        info!("Archive cache holds {} requested months", paths.len());
        Ok(paths)
    }

    /// Download to a temporary file and rename into place, so a failure never leaves a
    /// truncated cache entry.
    fn download(&self, url: &str, path: &Path) -> Result<(), String> {
        info!("Downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| format!("request to {} failed: {}", url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("{} returned HTTP {}", url, status));
        }
        let body = response
            .bytes()
            .map_err(|e| format!("failed to read body of {}: {}", url, e))?;

        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| format!("failed to create {}: {}", self.cache_dir.display(), e))?;
        let temp_path = path.with_extension("csv.part");
        let mut file = fs::File::create(&temp_path)
            .map_err(|e| format!("failed to create {}: {}", temp_path.display(), e))?;
        file.write_all(&body)
            .map_err(|e| format!("failed to write {}: {}", temp_path.display(), e))?;
        fs::rename(&temp_path, path)
            .map_err(|e| format!("failed to move download into {}: {}", path.display(), e))?;

        debug!("Downloaded {} bytes into {}", body.len(), path.display());
        Ok(())
    }
}

impl PartitionSource for ArchiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }

    fn plan(&self, window: &TimeWindow, now: DateTime<Utc>) -> WelResult<Vec<PartitionDescriptor>> {
        months_spanning(window, self.source_offset)
            .into_iter()
            .map(|month| {
                let period = month.period(self.source_offset)?;
                Ok(PartitionDescriptor {
                    label: month.to_string(),
                    open: period.end() > now,
                    period,
                    locator: PartitionLocator::MonthlyFile {
                        month,
                        path: self.month_path(month),
                        url: self.month_url(month),
                    },
                })
            })
            .collect()
    }

    fn load(&self, partition: &PartitionDescriptor) -> WelResult<DataFrame> {
        let month = match &partition.locator {
            PartitionLocator::MonthlyFile { month, .. } => *month,
            other => {
                return Err(WelError::partition(
                    partition.label.clone(),
                    format!("archive source cannot load {:?}", other),
                ))
            }
        };

        // Open months are still being written by the logger
        let path = self.fetch_month(month, partition.open)?;
        read_month_file(&path, &partition.label, self.source_offset)
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        Some(self.start.first_instant(self.source_offset))
    }
}

/// Parse one monthly export into the normalized frame layout.
///
/// `Date` + `Time` become one timestamp in `offset`; every other column is read as `f64` with
/// unparsable cells stored as missing. Rows without a readable date/time are dropped.
pub fn read_month_file(path: &Path, label: &str, offset: FixedOffset) -> WelResult<DataFrame> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| WelError::partition(label, format!("cannot open {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| WelError::partition(label, format!("unreadable header in {}: {}", path.display(), e)))?
        .clone();

    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let (date_idx, time_idx) = match (find(DATE_COLUMN), find(TIME_COLUMN)) {
        (Some(d), Some(t)) => (d, t),
        _ => {
            return Err(WelError::partition(
                label,
                format!("{} has no {}/{} columns", path.display(), DATE_COLUMN, TIME_COLUMN),
            ))
        }
    };

    let channel_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(idx, name)| *idx != date_idx && *idx != time_idx && !name.is_empty())
        .map(|(idx, name)| (idx, name.to_string()))
        .collect();

    let mut timestamps = Vec::new();
    let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); channel_columns.len()];
    let mut skipped = 0usize;

    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                debug!("Skipping unreadable row in {}: {}", label, e);
                skipped += 1;
                continue;
            }
        };

        let timestamp = record
            .get(date_idx)
            .zip(record.get(time_idx))
            .and_then(|(date, time)| combine_date_time(date, time, offset));
        let Some(timestamp) = timestamp else {
            skipped += 1;
            continue;
        };

        timestamps.push(timestamp.timestamp_millis());
        for (slot, (idx, _)) in columns.iter_mut().zip(channel_columns.iter()) {
            slot.push(record.get(*idx).and_then(parse_number));
        }
    }

    if skipped > 0 {
        warn!("Dropped {} rows without a readable date/time from {}", skipped, label);
    }

    let named = channel_columns
        .into_iter()
        .map(|(_, name)| name)
        .zip(columns)
        .collect();
    let mut df = frame::build_frame(timestamps, named)
        .map_err(|e| WelError::partition(label, format!("failed to build frame: {}", e)))?;
    frame::shift_back_one(&mut df, &SHIFTED_POWER_CHANNELS)
        .map_err(|e| WelError::partition(label, format!("failed to align power channels: {}", e)))?;

    debug!("Loaded {} samples from {}", df.height(), path.display());
    Ok(df)
}

/// Local `Date` and `Time` fields to an instant. The offset is applied here and nowhere else.
fn combine_date_time(date: &str, time: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), DATE_FORMAT).ok()?;
    let time = TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(time.trim(), fmt).ok())?;
    offset
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Create a progress bar for downloads
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template(&format!("[{{elapsed_precise}}] {{bar:40.cyan/blue}} {{pos}}/{{len}} {} {{msg}}", message))
    {
        pb.set_style(style.progress_chars("##-"));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn offset() -> FixedOffset {
        FixedOffset::west_opt(5 * 3600).unwrap()
    }

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    fn offline_config(dir: &Path) -> Config {
        Config {
            cache_dir: dir.to_path_buf(),
            endpoint_template: String::new(),
            ..Config::default()
        }
    }

    const NOVEMBER: &str = "Date,Time,HP_W,TAH_W,outside_T,heat_1_b\n\
        11/03/2019,00:00:00,1000,120,30.5,1\n\
        11/03/2019,00:01:00,1100,130,bad,1\n\
        11/03/2019,00:02:00,1200,140,31.5,0\n";

    #[test]
    fn test_read_month_file_combines_date_and_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2019-11.csv");
        fs::write(&path, NOVEMBER).unwrap();

        let df = read_month_file(&path, "2019-11", offset()).unwrap();
        assert_eq!(df.height(), 3);

        let ts = frame::timestamps(&df).unwrap();
        assert_eq!(ts[0], utc("2019-11-03T05:00:00Z").timestamp_millis());
        assert_eq!(ts[1] - ts[0], 60_000);
        assert_eq!(
            frame::channel_names(&df),
            vec!["HP_W", "TAH_W", "outside_T", "heat_1_b"]
        );
    }

    #[test]
    fn test_unparsable_values_become_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2019-11.csv");
        fs::write(&path, NOVEMBER).unwrap();

        let df = read_month_file(&path, "2019-11", offset()).unwrap();
        assert_eq!(frame::values(&df, "outside_T").unwrap(), vec![Some(30.5), None, Some(31.5)]);
    }

    #[test]
    fn test_power_channels_shifted_back_one_sample() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2019-11.csv");
        fs::write(&path, NOVEMBER).unwrap();

        let df = read_month_file(&path, "2019-11", offset()).unwrap();
        assert_eq!(frame::values(&df, "HP_W").unwrap(), vec![Some(1100.0), Some(1200.0), None]);
        assert_eq!(frame::values(&df, "TAH_W").unwrap(), vec![Some(130.0), Some(140.0), None]);
        assert_eq!(frame::values(&df, "heat_1_b").unwrap(), vec![Some(1.0), Some(1.0), Some(0.0)]);
    }

    #[test]
    fn test_rows_with_bad_dates_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2019-11.csv");
        fs::write(&path, "Date,Time,outside_T\n11/03/2019,00:00:00,1\nnot a date,00:01:00,2\n").unwrap();

        let df = read_month_file(&path, "2019-11", offset()).unwrap();
        assert_eq!(df.height(), 1);
    }

    #[test]
    fn test_missing_date_columns_is_unavailable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2019-11.csv");
        fs::write(&path, "when,outside_T\n1,2\n").unwrap();

        let result = read_month_file(&path, "2019-11", offset());
        assert!(matches!(result, Err(WelError::PartitionUnavailable { .. })));
    }

    #[test]
    fn test_missing_file_without_endpoint_is_unavailable() {
        let dir = tempdir().unwrap();
        let source = ArchiveSource::new(&offline_config(dir.path())).unwrap();
        let err = source.fetch_month(YearMonth::new(2019, 11), false).unwrap_err();
        match err {
            WelError::PartitionUnavailable { partition, .. } => assert_eq!(partition, "2019-11"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_open_month_falls_back_to_cache_without_endpoint() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("2019-11.csv"), NOVEMBER).unwrap();
        let source = ArchiveSource::new(&offline_config(dir.path())).unwrap();
        let window = TimeWindow::new(utc("2019-11-03T00:00:00Z"), utc("2019-11-04T00:00:00Z")).unwrap();
        let plan = source.plan(&window, utc("2019-11-05T00:00:00Z")).unwrap();
        assert!(plan[0].open);

        let df = source.load(&plan[0]).unwrap();
        assert_eq!(df.height(), 3);
    }

    #[test]
    fn test_failed_refresh_keeps_cached_month() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2019-11.csv");
        fs::write(&path, NOVEMBER).unwrap();
        let config = Config {
            endpoint_template: "http://127.0.0.1:9/{year}-{month}.csv".to_string(),
            ..offline_config(dir.path())
        };
        let source = ArchiveSource::new(&config).unwrap();

        assert_eq!(source.fetch_month(YearMonth::new(2019, 11), true).unwrap(), path);
        assert_eq!(fs::read_to_string(&path).unwrap(), NOVEMBER);
        assert!(source.fetch_month(YearMonth::new(2019, 12), true).is_err());
    }

    #[test]
    fn test_month_url_template() {
        let dir = tempdir().unwrap();
        let config = Config {
            endpoint_template: "http://logger.local/{year}/{month}.csv".to_string(),
            ..offline_config(dir.path())
        };
        let source = ArchiveSource::new(&config).unwrap();
        assert_eq!(
            source.month_url(YearMonth::new(2019, 3)).as_deref(),
            Some("http://logger.local/2019/03.csv")
        );
        assert!(source.month_path(YearMonth::new(2019, 3)).ends_with("2019-03.csv"));
    }

    #[test]
    fn test_plan_marks_open_month() {
        let dir = tempdir().unwrap();
        let source = ArchiveSource::new(&offline_config(dir.path())).unwrap();
        let window = TimeWindow::new(utc("2019-10-30T00:00:00Z"), utc("2019-11-02T00:00:00Z")).unwrap();
        let plan = source.plan(&window, utc("2019-11-05T00:00:00Z")).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].label, "2019-10");
        assert!(!plan[0].open);
        assert_eq!(plan[1].label, "2019-11");
        assert!(plan[1].open);
    }
}
