//! Keeps one stitched dataset in memory and reloads partitions only when a request falls outside
//! what is already covered.

mod dataset;

pub use dataset::Dataset;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::catalog::{ChannelCatalog, ChannelKind};
use crate::config::{Config, SourceKind};
use crate::derived::with_derived_channels;
use crate::error::{WelError, WelResult};
use crate::expr::{self, ResolvedSeries};
use crate::frame;
use crate::partition::{ArchiveSource, LiveSource, PartitionDescriptor, PartitionSource};
use crate::status::{apply_mask, decode_status, stack_level};
use crate::window::{self, TimeWindow, WindowRequest, DEFAULT_LOOKBACK_HOURS};

struct Cache {
    dataset: Dataset,
    coverage: TimeWindow,
    catalog: ChannelCatalog,
}

pub struct DatasetStitcher {
    config: Config,
    tz: Tz,
    source: Box<dyn PartitionSource>,
    cache: Option<Cache>,
}

impl DatasetStitcher {
    pub fn new(config: Config, source: Box<dyn PartitionSource>) -> WelResult<Self> {
        config.validate()?;
        let tz = config.timezone()?;
        Ok(Self {
            config,
            tz,
            source,
            cache: None,
        })
    }

    /// Build the stitcher over whichever source `config.source` selects.
    pub fn from_config(config: Config) -> WelResult<Self> {
        let source: Box<dyn PartitionSource> = match config.source {
            SourceKind::Archive => Box::new(ArchiveSource::new(&config)?),
            SourceKind::Live => Box::new(LiveSource::new(&config)?),
        };
        Self::new(config, source)
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn ensure_coverage(&mut self, window: &TimeWindow) -> WelResult<()> {
        self.ensure_coverage_at(window, Utc::now())
    }

    /// Make sure the cached dataset covers `window`, loading and stitching partitions if not.
    /// On failure the previous cache is left as it was.
    pub fn ensure_coverage_at(&mut self, window: &TimeWindow, now: DateTime<Utc>) -> WelResult<()> {
        if let Some(cache) = &self.cache {
            if cache.coverage.covers(window) || window.is_empty() {
                debug!("Cache hit for {} (coverage {})", window, cache.coverage);
                return Ok(());
            }
        }

        let plan = self.source.plan(window, now)?;
        info!("Loading {} partition(s) from {} source for {}", plan.len(), self.source.kind(), window);

        let kind = self.source.kind();
        let mut frames = Vec::with_capacity(plan.len());
        for (idx, partition) in plan.iter().enumerate() {
            debug!("Loading partition {} ({}/{})", partition.label, idx + 1, plan.len());
            let df = self.source.load(partition)?;
            let df = match kind {
                SourceKind::Archive => with_derived_channels(&df, kind)
                    .map_err(|e| WelError::partition(partition.label.clone(), e))?,
                SourceKind::Live => df,
            };
            frames.push(df);
        }

        let label = plan
            .iter()
            .map(|p| p.label.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let to_partition_error = |e: PolarsError| WelError::partition(label.clone(), e);

        let mut merged = merge_frames(&frames).map_err(to_partition_error)?;
        if kind == SourceKind::Live {
            merged = with_derived_channels(&merged, kind).map_err(to_partition_error)?;
        }

        let coverage = coverage_of(&plan, window, now)?;
        let dataset = Dataset::new(merged).map_err(to_partition_error)?;
        let catalog = ChannelCatalog::from_names(&dataset.channel_names(), &self.config.status_channels);

        info!(
            "Stitched {} rows across {} channels, coverage {}",
            dataset.len(),
            catalog.len(),
            coverage
        );
        self.cache = Some(Cache {
            dataset,
            coverage,
            catalog,
        });
        Ok(())
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.cache.as_ref().map(|c| &c.dataset)
    }

    pub fn coverage(&self) -> Option<TimeWindow> {
        self.cache.as_ref().map(|c| c.coverage)
    }

    pub fn catalog(&self) -> Option<&ChannelCatalog> {
        self.cache.as_ref().map(|c| &c.catalog)
    }

    /// Channel names in catalog order; empty before the first load.
    pub fn channels(&self) -> Vec<String> {
        self.catalog().map(ChannelCatalog::names).unwrap_or_default()
    }

    pub fn invalidate(&mut self) {
        if self.cache.take().is_some() {
            debug!("Dropped cached dataset");
        }
    }

    pub fn extent(&self) -> WelResult<TimeWindow> {
        self.extent_at(Utc::now())
    }

    /// Span of data known to exist: the cached samples if any, otherwise the source's first
    /// instant through `now`.
    pub fn extent_at(&self, now: DateTime<Utc>) -> WelResult<TimeWindow> {
        if let Some(extent) = self.dataset().and_then(Dataset::extent) {
            return Ok(extent);
        }
        let earliest = self
            .source
            .earliest()
            .unwrap_or_else(|| now - Duration::hours(DEFAULT_LOOKBACK_HOURS));
        TimeWindow::new(earliest.min(now), now)
    }

    pub fn resolve_window(&self, request: &WindowRequest, now: DateTime<Utc>) -> WelResult<TimeWindow> {
        window::resolve_window(request, &self.extent_at(now)?, now, self.tz)
    }

    pub fn resolve(&self, expression: &str, window: &TimeWindow, decode: bool) -> WelResult<ResolvedSeries> {
        let cache = self.cache.as_ref().ok_or(WelError::NotLoaded)?;
        if !cache.coverage.covers(window) {
            warn!("Window {} is outside the loaded coverage {}", window, cache.coverage);
        }
        expr::resolve(expression, &cache.dataset, &cache.catalog, window, decode, self.tz)
    }

    /// Resolve `expression`, then blank every sample where `mask_channel` is off.
    pub fn resolve_masked(
        &self,
        expression: &str,
        window: &TimeWindow,
        decode: bool,
        mask_channel: &str,
    ) -> WelResult<ResolvedSeries> {
        let cache = self.cache.as_ref().ok_or(WelError::NotLoaded)?;
        let mut series = self.resolve(expression, window, decode)?;

        if !cache.catalog.contains(mask_channel) {
            let reason = match cache.catalog.suggest(mask_channel, 1).into_iter().next() {
                Some(suggestion) => format!("unknown mask channel '{}', did you mean '{}'?", mask_channel, suggestion),
                None => format!("unknown mask channel '{}'", mask_channel),
            };
            return Err(WelError::expression(expression, reason));
        }
        let rows = cache.dataset.window_range(window);
        let raw = cache
            .dataset
            .values(mask_channel, rows)
            .map_err(|e| WelError::expression(expression, e))?;

        series.values = apply_mask(&series.values, &decode_status(&raw));
        series.name = format!("{} [{}]", expression, mask_channel);
        Ok(series)
    }

    /// Decoded status channels stacked one level apart, bottom to top in configured order.
    pub fn status_overview(&self, window: &TimeWindow) -> WelResult<Vec<ResolvedSeries>> {
        let cache = self.cache.as_ref().ok_or(WelError::NotLoaded)?;

        let mut names: Vec<String> = self
            .config
            .status_channels
            .iter()
            .filter(|name| cache.catalog.contains(name))
            .cloned()
            .collect();
        if names.is_empty() {
            names = cache
                .catalog
                .iter()
                .filter(|c| c.kind == ChannelKind::RawStatus)
                .map(|c| c.name.clone())
                .collect();
        }

        names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let mut series = expr::resolve(name, &cache.dataset, &cache.catalog, window, true, self.tz)?;
                series.values = stack_level(&series.values, idx + 1);
                Ok(series)
            })
            .collect()
    }
}

/// Union of the planned periods, ending no later than the load instant. Data past `now` has not
/// been recorded yet, so a later request reaching beyond it must reload.
fn coverage_of(plan: &[PartitionDescriptor], window: &TimeWindow, now: DateTime<Utc>) -> WelResult<TimeWindow> {
    let start = plan.iter().map(|p| p.period.start()).min();
    let end = plan.iter().map(|p| p.period.end()).max();
    match (start, end) {
        (Some(start), Some(end)) => TimeWindow::new(start, end.min(now).max(start)),
        _ => Ok(*window),
    }
}

/// Concatenate partitions in load order with columns aligned by name (absent channels are
/// missing), sort by timestamp and keep the later-loaded row when timestamps repeat.
fn merge_frames(frames: &[DataFrame]) -> PolarsResult<DataFrame> {
    let mut names: Vec<String> = Vec::new();
    for df in frames {
        for name in frame::channel_names(df) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    let mut parts = frames.iter();
    let Some(first) = parts.next() else {
        return frame::build_frame(Vec::new(), Vec::new());
    };
    let mut stacked = frame::align_channels(first, &names)?;
    for df in parts {
        stacked.vstack_mut(&frame::align_channels(df, &names)?)?;
    }

    let rows = stacked.height();
    let merged = stacked
        .sort([frame::TIMESTAMP_COL], false, true)?
        .unique_stable(Some(&[frame::TIMESTAMP_COL.to_string()]), UniqueKeepStrategy::Last, None)?;
    if merged.height() < rows {
        debug!("Dropped {} duplicate timestamp(s) while stitching", rows - merged.height());
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionLocator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const MINUTE: i64 = 60_000;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn window(start_ms: i64, end_ms: i64) -> TimeWindow {
        TimeWindow::new(at(start_ms), at(end_ms)).unwrap()
    }

    /// Partitions of ten minutes each, held in memory.
    struct FakeSource {
        kind: SourceKind,
        partitions: Vec<(TimeWindow, DataFrame)>,
        loads: Arc<AtomicUsize>,
        failing: Option<usize>,
    }

    impl PartitionSource for FakeSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn plan(&self, window: &TimeWindow, now: DateTime<Utc>) -> WelResult<Vec<PartitionDescriptor>> {
            Ok(self
                .partitions
                .iter()
                .enumerate()
                .filter(|(_, (period, _))| period.start() < window.end() && window.start() < period.end())
                .map(|(idx, (period, _))| PartitionDescriptor {
                    label: format!("part-{}", idx),
                    period: *period,
                    locator: PartitionLocator::Query { table: idx.to_string() },
                    open: period.end() > now,
                })
                .collect())
        }

        fn load(&self, partition: &PartitionDescriptor) -> WelResult<DataFrame> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let idx: usize = match &partition.locator {
                PartitionLocator::Query { table } => table.parse().unwrap(),
                other => panic!("unexpected locator {:?}", other),
            };
            if self.failing == Some(idx) {
                return Err(WelError::partition(partition.label.clone(), "file is corrupt"));
            }
            Ok(self.partitions[idx].1.clone())
        }

        fn earliest(&self) -> Option<DateTime<Utc>> {
            self.partitions.first().map(|(period, _)| period.start())
        }
    }

    /// One sample per minute across `[start_min, end_min)`, `outside_T` equal to the minute.
    fn partition(start_min: i64, end_min: i64) -> (TimeWindow, DataFrame) {
        let ts: Vec<i64> = (start_min..end_min).map(|m| m * MINUTE).collect();
        let outside: Vec<Option<f64>> = (start_min..end_min).map(|m| Some(m as f64)).collect();
        let hp_w: Vec<Option<f64>> = (start_min..end_min).map(|_| Some(0.0)).collect();
        let df = frame::build_frame(
            ts,
            vec![("outside_T".to_string(), outside), ("HP_W".to_string(), hp_w)],
        )
        .unwrap();
        (window(start_min * MINUTE, end_min * MINUTE), df)
    }

    fn stitcher(partitions: Vec<(TimeWindow, DataFrame)>, failing: Option<usize>) -> (DatasetStitcher, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            kind: SourceKind::Archive,
            partitions,
            loads: loads.clone(),
            failing,
        };
        let config = Config {
            display_timezone: "UTC".to_string(),
            ..Config::default()
        };
        (DatasetStitcher::new(config, Box::new(source)).unwrap(), loads)
    }

    fn now() -> DateTime<Utc> {
        at(1_000 * MINUTE)
    }

    #[test]
    fn test_resolve_before_load_is_not_loaded() {
        let (stitcher, _) = stitcher(vec![partition(0, 10)], None);
        assert!(matches!(
            stitcher.resolve("outside_T", &window(0, MINUTE), false),
            Err(WelError::NotLoaded)
        ));
        assert!(stitcher.channels().is_empty());
    }

    #[test]
    fn test_adjacent_partitions_stitch_without_gaps() {
        let (mut stitcher, loads) = stitcher(vec![partition(0, 10), partition(10, 20)], None);
        let w = window(0, 20 * MINUTE);
        stitcher.ensure_coverage_at(&w, now()).unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        let ds = stitcher.dataset().unwrap();
        assert_eq!(ds.len(), 20);
        assert!(ds.timestamps().windows(2).all(|pair| pair[1] - pair[0] == MINUTE));
        assert_eq!(stitcher.coverage(), Some(w));
    }

    #[test]
    fn test_covered_window_is_a_no_op() {
        let (mut stitcher, loads) = stitcher(vec![partition(0, 10), partition(10, 20)], None);
        let w = window(0, 20 * MINUTE);
        stitcher.ensure_coverage_at(&w, now()).unwrap();
        let before = stitcher.dataset().unwrap().frame().clone();

        stitcher.ensure_coverage_at(&w, now()).unwrap();
        stitcher.ensure_coverage_at(&window(5 * MINUTE, 6 * MINUTE), now()).unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(stitcher.dataset().unwrap().frame().equals_missing(&before));
    }

    #[test]
    fn test_failed_partition_keeps_previous_cache() {
        // the second of three partitions is corrupt
        let (mut stitcher, _) = stitcher(vec![partition(0, 10), partition(10, 20), partition(20, 30)], Some(1));
        let first = window(0, 5 * MINUTE);
        stitcher.ensure_coverage_at(&first, now()).unwrap();
        let before = stitcher.dataset().unwrap().frame().clone();

        let err = stitcher.ensure_coverage_at(&window(0, 30 * MINUTE), now()).unwrap_err();
        match err {
            WelError::PartitionUnavailable { partition, .. } => assert_eq!(partition, "part-1"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(stitcher.coverage(), Some(window(0, 10 * MINUTE)));
        assert!(stitcher.dataset().unwrap().frame().equals_missing(&before));
    }

    #[test]
    fn test_duplicate_timestamps_keep_later_partition() {
        let first = partition(0, 10);
        let (period, _) = partition(5, 15);
        let overlap = frame::build_frame(
            (5..15).map(|m| m * MINUTE).collect(),
            vec![("outside_T".to_string(), vec![Some(-1.0); 10])],
        )
        .unwrap();
        let (mut stitcher, _) = stitcher(vec![first, (period, overlap)], None);
        let w = window(0, 15 * MINUTE);
        stitcher.ensure_coverage_at(&w, now()).unwrap();

        let series = stitcher.resolve("outside_T", &w, false).unwrap();
        assert_eq!(series.len(), 15);
        assert_eq!(series.values[4], Some(4.0));
        assert_eq!(series.values[5], Some(-1.0));
        // channel absent from the later partition comes back missing there
        let hp = stitcher.resolve("HP_W", &w, false).unwrap();
        assert_eq!(hp.values[4], Some(0.0));
        assert_eq!(hp.values[5], None);
    }

    #[test]
    fn test_resolve_restricted_to_window() {
        let (mut stitcher, _) = stitcher(vec![partition(0, 10), partition(10, 20)], None);
        stitcher.ensure_coverage_at(&window(0, 20 * MINUTE), now()).unwrap();

        let w = window(3 * MINUTE, 13 * MINUTE);
        let series = stitcher.resolve("outside_T", &w, false).unwrap();
        assert_eq!(series.len(), 10);
        assert!(series
            .timestamps
            .iter()
            .all(|ts| w.contains_ms(ts.timestamp_millis())));
        assert!(series.timestamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_zero_power_gives_missing_cop() {
        let (mut stitcher, _) = stitcher(vec![partition(0, 10)], None);
        let w = window(0, 10 * MINUTE);
        stitcher.ensure_coverage_at(&w, now()).unwrap();

        assert!(stitcher.channels().contains(&"COP".to_string()));
        let cop = stitcher.resolve("COP", &w, false).unwrap();
        assert!(cop.values.iter().all(Option::is_none));
    }

    #[test]
    fn test_coverage_capped_at_now() {
        let (mut stitcher, _) = stitcher(vec![partition(0, 10)], None);
        stitcher.ensure_coverage_at(&window(0, 2 * MINUTE), at(4 * MINUTE)).unwrap();
        assert_eq!(stitcher.coverage(), Some(window(0, 4 * MINUTE)));
    }

    #[test]
    fn test_reload_once_now_passes_coverage_end() {
        let (mut stitcher, loads) = stitcher(vec![partition(0, 10), partition(10, 20)], None);
        stitcher.ensure_coverage_at(&window(0, 20 * MINUTE), at(5 * MINUTE)).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(stitcher.coverage(), Some(window(0, 5 * MINUTE)));

        // samples recorded after the first load must be picked up
        stitcher.ensure_coverage_at(&window(0, 15 * MINUTE), at(15 * MINUTE)).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 4);
        assert_eq!(stitcher.coverage(), Some(window(0, 15 * MINUTE)));
    }

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    fn assert_close(actual: &[Option<f64>], expected: &[Option<f64>]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            match (a, e) {
                (Some(a), Some(e)) => assert!((a - e).abs() < 1e-9, "{} != {}", a, e),
                (a, e) => assert_eq!(a, e),
            }
        }
    }

    #[test]
    fn test_archive_months_stitched_across_boundary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("2019-10.csv"),
            "Date,Time,HP_W,TAH_fpm,TAH_in_T,TAH_out_T\n\
             10/31/2019,23:58:00,1000,10,20,22\n\
             10/31/2019,23:59:00,2000,10,20,22\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("2019-11.csv"),
            "Date,Time,HP_W,TAH_fpm,TAH_in_T,TAH_out_T\n\
             11/01/2019,00:00:00,3000,10,20,22\n\
             11/01/2019,00:01:00,4000,10,20,22\n",
        )
        .unwrap();
        let config = Config {
            source: SourceKind::Archive,
            cache_dir: dir.path().to_path_buf(),
            endpoint_template: String::new(),
            display_timezone: "UTC".to_string(),
            ..Config::default()
        };
        let source = ArchiveSource::new(&config).unwrap();
        let mut stitcher = DatasetStitcher::new(config, Box::new(source)).unwrap();

        // November is still open at this instant and only exists in the cache
        let w = TimeWindow::new(utc("2019-11-01T04:00:00Z"), utc("2019-11-01T06:00:00Z")).unwrap();
        stitcher.ensure_coverage_at(&w, utc("2019-11-01T12:00:00Z")).unwrap();
        assert_eq!(
            stitcher.coverage(),
            Some(TimeWindow::new(utc("2019-10-01T05:00:00Z"), utc("2019-11-01T12:00:00Z")).unwrap())
        );

        // power moves back within each month, never across the boundary
        let hp = stitcher.resolve("HP_W", &w, false).unwrap();
        assert_eq!(hp.values, vec![Some(2000.0), None, Some(4000.0), None]);
        assert_eq!(hp.timestamps[2].timestamp_millis(), utc("2019-11-01T05:00:00Z").timestamp_millis());

        let cop = stitcher.resolve("COP", &w, false).unwrap();
        assert_close(&cop.values, &[Some(4.255), None, Some(2.1275), None]);
    }

    #[test]
    fn test_live_table_derived_after_merge() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE wel_samples (
                timestamp BIGINT NOT NULL,
                HP_W DOUBLE,
                TAH_fpm DOUBLE,
                TAH_in_T DOUBLE,
                TAH_out_T DOUBLE
            );
            INSERT INTO wel_samples VALUES
                (1572757200, 500, 26, 20, 21),
                (1572757260, 1000, 10, 20, 21),
                (1572757320, 1000, 10, 20, 21);
            "#,
        )
        .unwrap();
        let config = Config {
            source: SourceKind::Live,
            display_timezone: "UTC".to_string(),
            ..Config::default()
        };
        let source = LiveSource::from_connection(conn, "wel_samples");
        let mut stitcher = DatasetStitcher::new(config, Box::new(source)).unwrap();

        let w = TimeWindow::new(utc("2019-11-03T05:00:00Z"), utc("2019-11-03T06:00:00Z")).unwrap();
        stitcher.ensure_coverage_at(&w, utc("2019-11-04T00:00:00Z")).unwrap();
        assert!(stitcher.channels().contains(&"COP".to_string()));

        let hp = stitcher.resolve("HP_W", &w, false).unwrap();
        assert_eq!(hp.values, vec![Some(1000.0), Some(1000.0), None]);

        // 11.06 is above the live clip of 10
        let cop = stitcher.resolve("COP", &w, false).unwrap();
        assert_close(&cop.values, &[None, Some(4.255), None]);
    }

    #[test]
    fn test_status_overview_and_mask() {
        let (period, _) = partition(0, 4);
        let df = frame::build_frame(
            (0..4).map(|m| m * MINUTE).collect(),
            vec![
                ("outside_T".to_string(), vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]),
                ("heat_1_b".to_string(), vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]),
                ("heat_2_b".to_string(), vec![Some(3.0), Some(3.0), Some(2.0), Some(2.0)]),
            ],
        )
        .unwrap();
        let (mut stitcher, _) = stitcher(vec![(period, df)], None);
        let w = window(0, 4 * MINUTE);
        stitcher.ensure_coverage_at(&w, now()).unwrap();

        let overview = stitcher.status_overview(&w).unwrap();
        assert_eq!(overview.len(), 2);
        assert_eq!(overview[0].name, "heat_1_b");
        assert_eq!(overview[0].values, vec![Some(1.0), None, Some(1.0), None]);
        assert_eq!(overview[1].values, vec![Some(2.0), Some(2.0), None, None]);

        let masked = stitcher.resolve_masked("outside_T", &w, false, "heat_2_b").unwrap();
        assert_eq!(masked.values, vec![Some(1.0), Some(2.0), None, None]);
        assert!(stitcher.resolve_masked("outside_T", &w, false, "heat_9").is_err());
    }

    #[test]
    fn test_extent_and_invalidate() {
        let (mut stitcher, _) = stitcher(vec![partition(0, 10)], None);
        assert_eq!(stitcher.extent_at(now()).unwrap(), window(0, 1_000 * MINUTE));

        stitcher.ensure_coverage_at(&window(0, 10 * MINUTE), now()).unwrap();
        assert_eq!(stitcher.extent_at(now()).unwrap(), window(0, 9 * MINUTE + 1));

        stitcher.invalidate();
        assert!(stitcher.dataset().is_none());
    }
}
