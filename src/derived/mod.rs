//! Channels computed from raw readings.
//!
//! | channel     | definition                                             | clipped above |
//! |-------------|--------------------------------------------------------|---------------|
//! | `T_diff`    | `living_T - outside_T`                                 |               |
//! | `COP`       | `K1 * TAH_fpm * abs(TAH_out_T - TAH_in_T) / (HP_W/1000)` | 12 archive, 10 live |
//! | `well_W`    | `K2 * abs(loop_out_T - loop_in_T)`                     |               |
//! | `well_COP`  | `well_W / (HP_W/1000)`                                 | 10            |
//! | `power_tot` | `HP_W + TAH_W`                                         |               |
//!
//! Missing inputs, division by zero and clipped values all produce missing samples.

use polars::prelude::*;
use tracing::debug;

use crate::config::SourceKind;

pub const T_DIFF: &str = "T_diff";
pub const COP: &str = "COP";
pub const WELL_W: &str = "well_W";
pub const WELL_COP: &str = "well_COP";
pub const POWER_TOT: &str = "power_tot";

/// Every derived channel in the order it is appended to a frame
pub const DERIVED_CHANNELS: [&str; 5] = [T_DIFF, COP, WELL_W, WELL_COP, POWER_TOT];

/// Air-side heat constant
pub const K1: f64 = 1.15 * 0.37;
/// Loop-side heat constant (flow in kg/s times specific heat of water)
pub const K2: f64 = 0.0008517177e3 * 4.186;

pub const WELL_COP_MAX: f64 = 10.0;

/// Upper bound on a plausible air-side COP. The archive and live loggers disagree on how noisy
/// the airflow reading is, so each keeps its own limit.
pub fn cop_max(source: SourceKind) -> f64 {
    match source {
        SourceKind::Archive => 12.0,
        SourceKind::Live => 10.0,
    }
}

/// Raw channels the derivations read; absent ones are treated as all-missing.
const INPUT_CHANNELS: [&str; 9] = [
    "living_T",
    "outside_T",
    "TAH_in_T",
    "TAH_out_T",
    "TAH_fpm",
    "loop_in_T",
    "loop_out_T",
    "HP_W",
    "TAH_W",
];

/// Return `df` with every derived channel appended. Input columns are left untouched; an
/// existing derived column of the same name is replaced.
pub fn with_derived_channels(df: &DataFrame, source: SourceKind) -> PolarsResult<DataFrame> {
    let mut inputs = df.clone();
    for name in INPUT_CHANNELS {
        if !inputs.get_column_names().contains(&name) {
            inputs.with_column(Series::full_null(name, df.height(), &DataType::Float64))?;
        }
    }

    let air_heat = lit(K1) * col("TAH_fpm") * (col("TAH_out_T") - col("TAH_in_T")).abs();
    let well_w = lit(K2) * (col("loop_out_T") - col("loop_in_T")).abs();

    let derived = inputs
        .lazy()
        .select([
            (col("living_T") - col("outside_T")).alias(T_DIFF),
            clip_above(per_kilowatt(air_heat, col("HP_W")), cop_max(source)).alias(COP),
            well_w.clone().alias(WELL_W),
            clip_above(per_kilowatt(well_w, col("HP_W")), WELL_COP_MAX).alias(WELL_COP),
            (col("HP_W") + col("TAH_W")).alias(POWER_TOT),
        ])
        .collect()?;

    debug!(
        "Derived channels for {} samples ({} without a valid COP)",
        df.height(),
        derived.column(COP)?.null_count()
    );

    let mut out = df.clone();
    for series in derived.get_columns() {
        out.with_column(series.clone())?;
    }
    Ok(out)
}

/// `heat / (watts / 1000)`; zero power gives missing rather than infinity.
fn per_kilowatt(heat: Expr, watts: Expr) -> Expr {
    when(watts.clone().eq(lit(0.0)))
        .then(lit(NULL))
        .otherwise(heat / (watts / lit(1000.0)))
}

fn clip_above(values: Expr, max: f64) -> Expr {
    when(values.clone().gt(lit(max)))
        .then(lit(NULL))
        .otherwise(values)
}
