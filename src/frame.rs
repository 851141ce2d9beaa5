//! Helpers for the normalized frame layout every partition and the stitched dataset share:
//! an `Int64` column of UTC epoch milliseconds named [`TIMESTAMP_COL`] followed by one
//! `Float64` column per channel.

use polars::prelude::*;

pub const TIMESTAMP_COL: &str = "timestamp";

/// Build a normalized frame from a timestamp vector and named channel columns.
pub fn build_frame(timestamps_ms: Vec<i64>, columns: Vec<(String, Vec<Option<f64>>)>) -> PolarsResult<DataFrame> {
    let mut series = Vec::with_capacity(columns.len() + 1);
    series.push(Series::new(TIMESTAMP_COL, timestamps_ms));
    for (name, values) in columns {
        series.push(Series::new(&name, values));
    }
    DataFrame::new(series)
}

/// Channel names in frame order, without the timestamp column.
pub fn channel_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .filter(|name| **name != TIMESTAMP_COL)
        .map(|name| name.to_string())
        .collect()
}

pub fn timestamps(df: &DataFrame) -> PolarsResult<Vec<i64>> {
    let column = df.column(TIMESTAMP_COL)?.cast(&DataType::Int64)?;
    let values = column.i64()?;
    Ok(values.into_iter().map(|v| v.unwrap_or_default()).collect())
}

/// Values of one channel as `f64`; anything that does not cast becomes missing.
pub fn values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<f64>>> {
    series_values(df.column(name)?)
}

pub fn series_values(series: &Series) -> PolarsResult<Vec<Option<f64>>> {
    let cast = series.cast(&DataType::Float64)?;
    let values = cast.f64()?;
    Ok(values
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

/// Shift the named channels backward by one row: row `i` takes row `i + 1`'s value and the last
/// row becomes missing. Channels the frame lacks are ignored.
pub fn shift_back_one(df: &mut DataFrame, names: &[&str]) -> PolarsResult<()> {
    for name in names {
        if !df.get_column_names().contains(name) {
            continue;
        }
        let shifted = df.column(name)?.shift(-1);
        df.with_column(shifted)?;
    }
    Ok(())
}

/// Add an all-missing `Float64` column for every name the frame lacks, then order the channels
/// as `names`.
pub fn align_channels(df: &DataFrame, names: &[String]) -> PolarsResult<DataFrame> {
    let mut aligned = df.clone();
    for name in names {
        if !aligned.get_column_names().contains(&name.as_str()) {
            aligned.with_column(Series::full_null(name, aligned.height(), &DataType::Float64))?;
        }
    }
    let mut order = vec![TIMESTAMP_COL.to_string()];
    order.extend(names.iter().cloned());
    aligned.select(order)
}
