use polars::prelude::{
    self as pl, ClosedWindow, DataFrame, DataType, IntoLazy, NamedFrom, PolarsResult,
    RollingGroupOptions, Series,
};
use polars::series::IsSorted;
use std::collections::HashMap;

use super::parser::{BinOp, Expr};
use super::rewrite::ChannelRef;
use crate::frame;

const VALUE_COL: &str = "value";
const PRESENT_COL: &str = "present";

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

/// Function and method names the grammar understands
pub const KNOWN_NAMES: [&str; 11] = [
    "abs", "rolling", "diff", "shift", "mean", "sum", "min", "max", "median", "std", "count",
];

/// Intermediate result of evaluating a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Series(Vec<Option<f64>>),
    Scalar(Option<f64>),
    Text(String),
    /// `series.rolling(offset)` waiting for its aggregation
    Rolling { values: Vec<Option<f64>>, window_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Mean,
    Sum,
    Min,
    Max,
    Median,
    Std,
    Count,
}

impl Aggregate {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "mean" => Some(Aggregate::Mean),
            "sum" => Some(Aggregate::Sum),
            "min" => Some(Aggregate::Min),
            "max" => Some(Aggregate::Max),
            "median" => Some(Aggregate::Median),
            "std" => Some(Aggregate::Std),
            "count" => Some(Aggregate::Count),
            _ => None,
        }
    }

    /// Aggregation over the present values of the value column.
    fn expr(self) -> pl::Expr {
        let value = pl::col(VALUE_COL);
        match self {
            Aggregate::Mean => value.mean(),
            Aggregate::Sum => value.sum(),
            Aggregate::Min => value.min(),
            Aggregate::Max => value.max(),
            Aggregate::Median => value.median(),
            // sample standard deviation, like pandas
            Aggregate::Std => value.std(1),
            Aggregate::Count => value.is_not_null().sum(),
        }
    }

    /// Present values a window needs before the result is defined
    fn min_present(self) -> u32 {
        match self {
            Aggregate::Count => 0,
            Aggregate::Std => 2,
            _ => 1,
        }
    }
}

/// Evaluates a parsed expression over the samples of one window.
pub struct Evaluator<'a> {
    /// Sample timestamps, epoch milliseconds, strictly increasing
    pub timestamps: &'a [i64],
    /// Values of every channel the expression references, already restricted to the window
    pub channels: &'a HashMap<ChannelRef, Vec<Option<f64>>>,
}

impl<'a> Evaluator<'a> {
    pub fn eval(&self, expr: &Expr) -> Result<Value, String> {
        match expr {
            Expr::Number(value) => Ok(Value::Scalar(Some(*value))),
            Expr::Str(text) => Ok(Value::Text(text.clone())),
            Expr::Channel(channel) => self
                .channels
                .get(channel)
                .cloned()
                .map(Value::Series)
                .ok_or_else(|| format!("channel '{}' is not loaded", channel.name)),
            Expr::Neg(inner) => {
                let value = self.eval(inner)?;
                map_numeric(value, "-", |v| -v)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, lhs, rhs)
            }
            Expr::Call { name, args } => self.call(name, args),
            Expr::Method { target, name, args } => {
                let target = self.eval(target)?;
                self.method(target, name, args)
            }
        }
    }

    /// Evaluate to one value per sample; scalars are broadcast.
    pub fn eval_series(&self, expr: &Expr) -> Result<Vec<Option<f64>>, String> {
        match self.eval(expr)? {
            Value::Series(values) => Ok(values),
            Value::Scalar(value) => Ok(vec![value; self.timestamps.len()]),
            Value::Text(_) => Err("expression evaluates to a string, not a series".to_string()),
            Value::Rolling { .. } => {
                Err("rolling window needs an aggregation such as .mean()".to_string())
            }
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<Value, String> {
        match name {
            "abs" => {
                let [arg] = args else {
                    return Err(format!("abs() takes 1 argument, got {}", args.len()));
                };
                map_numeric(self.eval(arg)?, "abs", f64::abs)
            }
            other => Err(format!("unknown function '{}'", other)),
        }
    }

    fn method(&self, target: Value, name: &str, args: &[Expr]) -> Result<Value, String> {
        if let Some(aggregate) = Aggregate::from_name(name) {
            no_args(name, args)?;
            return match target {
                Value::Rolling { values, window_ms } => rolling(self.timestamps, values, window_ms, aggregate)
                    .map(Value::Series)
                    .map_err(|e| format!(".rolling().{}() failed: {}", name, e)),
                Value::Series(values) => aggregate_all(values, aggregate)
                    .map(Value::Scalar)
                    .map_err(|e| format!(".{}() failed: {}", name, e)),
                other => Err(format!(".{}() needs a series, got {}", name, kind(&other))),
            };
        }

        match name {
            "rolling" => {
                let values = expect_series(target, name)?;
                let [arg] = args else {
                    return Err(format!("rolling() takes 1 argument, got {}", args.len()));
                };
                let window_ms = match self.eval(arg)? {
                    Value::Text(offset) => parse_offset(&offset)?,
                    other => return Err(format!("rolling() needs an offset string like '6H', got {}", kind(&other))),
                };
                Ok(Value::Rolling { values, window_ms })
            }
            "abs" => {
                no_args(name, args)?;
                map_numeric(target, "abs", f64::abs)
            }
            "diff" => {
                no_args(name, args)?;
                let values = expect_series(target, name)?;
                let mut out = vec![None; values.len()];
                for i in 1..values.len() {
                    out[i] = values[i].zip(values[i - 1]).map(|(cur, prev)| cur - prev);
                }
                Ok(Value::Series(out))
            }
            "shift" => {
                let values = expect_series(target, name)?;
                let periods = match args {
                    [] => 1,
                    [arg] => match self.eval(arg)? {
                        Value::Scalar(Some(n)) if n.fract() == 0.0 => n as i64,
                        other => return Err(format!("shift() needs an integer, got {}", kind(&other))),
                    },
                    _ => return Err(format!("shift() takes at most 1 argument, got {}", args.len())),
                };
                Ok(Value::Series(shift(&values, periods)))
            }
            other => Err(format!("unknown method '.{}()'", other)),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Series(_) => "a series",
        Value::Scalar(_) => "a number",
        Value::Text(_) => "a string",
        Value::Rolling { .. } => "a rolling window",
    }
}

fn no_args(name: &str, args: &[Expr]) -> Result<(), String> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(format!(".{}() takes no arguments, got {}", name, args.len()))
    }
}

fn expect_series(value: Value, method: &str) -> Result<Vec<Option<f64>>, String> {
    match value {
        Value::Series(values) => Ok(values),
        other => Err(format!(".{}() needs a series, got {}", method, kind(&other))),
    }
}

fn finite(value: f64) -> Option<f64> {
    Some(value).filter(|v| v.is_finite())
}

fn map_numeric(value: Value, op: &str, f: impl Fn(f64) -> f64) -> Result<Value, String> {
    match value {
        Value::Series(values) => Ok(Value::Series(
            values.into_iter().map(|v| v.and_then(|x| finite(f(x)))).collect(),
        )),
        Value::Scalar(v) => Ok(Value::Scalar(v.and_then(|x| finite(f(x))))),
        other => Err(format!("cannot apply {} to {}", op, kind(&other))),
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    let apply = |a: Option<f64>, b: Option<f64>| -> Option<f64> {
        let (a, b) = (a?, b?);
        finite(match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
        })
    };

    match (lhs, rhs) {
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(apply(a, b))),
        (Value::Series(a), Value::Scalar(b)) => Ok(Value::Series(a.into_iter().map(|x| apply(x, b)).collect())),
        (Value::Scalar(a), Value::Series(b)) => Ok(Value::Series(b.into_iter().map(|y| apply(a, y)).collect())),
        (Value::Series(a), Value::Series(b)) => {
            if a.len() != b.len() {
                return Err(format!("series lengths differ ({} vs {})", a.len(), b.len()));
            }
            Ok(Value::Series(a.into_iter().zip(b).map(|(x, y)| apply(x, y)).collect()))
        }
        (a, b) => Err(format!("cannot combine {} with {}", kind(&a), kind(&b))),
    }
}

fn present_count() -> pl::Expr {
    pl::col(VALUE_COL).is_not_null().sum().alias(PRESENT_COL)
}

/// Read `value`/`present` rows back; rows with too few present values are missing.
fn collect_aggregate(df: &DataFrame, aggregate: Aggregate) -> PolarsResult<Vec<Option<f64>>> {
    let values = frame::series_values(df.column(VALUE_COL)?)?;
    let present = df.column(PRESENT_COL)?.cast(&DataType::UInt32)?;
    Ok(values
        .into_iter()
        .zip(present.u32()?)
        .map(|(value, n)| value.filter(|_| n.unwrap_or(0) >= aggregate.min_present()))
        .collect())
}

/// One aggregate over a whole series.
fn aggregate_all(values: Vec<Option<f64>>, aggregate: Aggregate) -> PolarsResult<Option<f64>> {
    let df = DataFrame::new(vec![Series::new(VALUE_COL, values)])?;
    let out = df
        .lazy()
        .select([aggregate.expr().alias(VALUE_COL), present_count()])
        .collect()?;
    Ok(collect_aggregate(&out, aggregate)?.into_iter().next().flatten())
}

/// Trailing time-based window `(t - window, t]` at every sample, like pandas' offset rolling
/// with `min_periods=1`.
fn rolling(
    timestamps: &[i64],
    values: Vec<Option<f64>>,
    window_ms: i64,
    aggregate: Aggregate,
) -> PolarsResult<Vec<Option<f64>>> {
    if timestamps.is_empty() {
        return Ok(Vec::new());
    }
    let mut index = Series::new(frame::TIMESTAMP_COL, timestamps);
    index.set_sorted_flag(IsSorted::Ascending);
    let df = DataFrame::new(vec![index, Series::new(VALUE_COL, values)])?;

    let options = RollingGroupOptions {
        period: pl::Duration::new(window_ms),
        offset: pl::Duration::new(-window_ms),
        closed_window: ClosedWindow::Right,
        ..Default::default()
    };
    let by: [pl::Expr; 0] = [];
    let out = df
        .lazy()
        .group_by_rolling(pl::col(frame::TIMESTAMP_COL), by, options)
        .agg([aggregate.expr().alias(VALUE_COL), present_count()])
        .collect()?;
    collect_aggregate(&out, aggregate)
}

/// Positive periods move values later in time, negative earlier; vacated slots are missing.
fn shift(values: &[Option<f64>], periods: i64) -> Vec<Option<f64>> {
    let len = values.len();
    let offset = usize::try_from(periods.unsigned_abs()).map_or(len, |n| n.min(len));
    let mut out = vec![None; len];
    if periods >= 0 {
        out[offset..].copy_from_slice(&values[..len - offset]);
    } else {
        out[..len - offset].copy_from_slice(&values[offset..]);
    }
    out
}

/// Pandas-style offset alias to milliseconds: "6H", "1D", "30min", "15T", "10S", "2W", "D".
pub fn parse_offset(raw: &str) -> Result<i64, String> {
    let text = raw.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let count: f64 = if number.is_empty() {
        1.0
    } else {
        number.parse().map_err(|_| format!("invalid offset '{}'", raw))?
    };

    let unit_ms = match unit.trim() {
        "ms" | "L" => 1,
        "S" | "s" | "sec" => MS_PER_SECOND,
        "T" | "min" => MS_PER_MINUTE,
        "H" | "h" => MS_PER_HOUR,
        "D" | "d" => MS_PER_DAY,
        "W" | "w" => 7 * MS_PER_DAY,
        _ => return Err(format!("unknown offset unit in '{}'", raw)),
    };

    let window_ms = (count * unit_ms as f64).round();
    if !window_ms.is_finite() || window_ms >= i64::MAX as f64 {
        return Err(format!("offset '{}' is too large", raw));
    }
    if window_ms <= 0.0 {
        return Err(format!("offset '{}' must be positive", raw));
    }
    Ok(window_ms as i64)
}
