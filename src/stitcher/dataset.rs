use chrono::{DateTime, Duration, Utc};
use polars::prelude::*;
use std::ops::Range;

use crate::frame;
use crate::window::TimeWindow;

/// A stitched, time-sorted frame with its timestamps kept alongside for range lookups.
#[derive(Debug, Clone)]
pub struct Dataset {
    frame: DataFrame,
    timestamps: Vec<i64>,
}

impl Dataset {
    /// Wrap a normalized frame whose timestamps are already strictly increasing.
    pub fn new(frame: DataFrame) -> PolarsResult<Self> {
        let timestamps = frame::timestamps(&frame)?;
        Ok(Self { frame, timestamps })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// UTC epoch milliseconds, strictly increasing
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn channel_names(&self) -> Vec<String> {
        frame::channel_names(&self.frame)
    }

    /// Row indices whose timestamps fall inside `[window.start, window.end)`.
    pub fn window_range(&self, window: &TimeWindow) -> Range<usize> {
        let start = self.timestamps.partition_point(|ts| *ts < window.start_ms());
        let end = self.timestamps.partition_point(|ts| *ts < window.end_ms());
        start..end.max(start)
    }

    /// Values of one channel for the given rows.
    pub fn values(&self, name: &str, rows: Range<usize>) -> PolarsResult<Vec<Option<f64>>> {
        let column = self.frame.column(name)?;
        frame::series_values(&column.slice(rows.start as i64, rows.len()))
    }

    /// `[first sample, last sample + 1ms)`, or `None` when empty.
    pub fn extent(&self) -> Option<TimeWindow> {
        let first = DateTime::<Utc>::from_timestamp_millis(*self.timestamps.first()?)?;
        let last = DateTime::<Utc>::from_timestamp_millis(*self.timestamps.last()?)?;
        TimeWindow::new(first, last + Duration::milliseconds(1)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        let frame = frame::build_frame(
            vec![0, 60_000, 120_000, 180_000],
            vec![("HP_W".to_string(), vec![Some(1.0), Some(2.0), None, Some(4.0)])],
        )
        .unwrap();
        Dataset::new(frame).unwrap()
    }

    fn window(start_ms: i64, end_ms: i64) -> TimeWindow {
        TimeWindow::new(
            DateTime::from_timestamp_millis(start_ms).unwrap(),
            DateTime::from_timestamp_millis(end_ms).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_window_range_is_half_open() {
        let ds = dataset();
        assert_eq!(ds.window_range(&window(60_000, 180_000)), 1..3);
        assert_eq!(ds.window_range(&window(0, 0)), 0..0);
        assert_eq!(ds.window_range(&window(500_000, 600_000)), 4..4);
    }

    #[test]
    fn test_values_slice() {
        let ds = dataset();
        assert_eq!(ds.values("HP_W", 1..3).unwrap(), vec![Some(2.0), None]);
        assert!(ds.values("nope", 0..1).is_err());
    }

    #[test]
    fn test_extent() {
        let ds = dataset();
        assert_eq!(ds.extent(), Some(window(0, 180_001)));
        let empty = Dataset::new(frame::build_frame(Vec::new(), Vec::new()).unwrap()).unwrap();
        assert_eq!(empty.extent(), None);
    }
}
