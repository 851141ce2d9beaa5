//! Derived expressions over dataset channels, e.g. `COP.rolling('6H').mean()` or
//! `(TAH_out_T - TAH_in_T) * 2`.
//!
//! Channel names are substituted textually first (see [`rewrite`]), then the result is parsed and
//! evaluated in a small closed grammar. Nothing is ever executed as code.

pub mod eval;
pub mod parser;
pub mod rewrite;

use chrono::DateTime;
use chrono_tz::Tz;
use std::collections::HashMap;
use tracing::debug;

use crate::catalog::ChannelCatalog;
use crate::error::{WelError, WelResult};
use crate::status::decode_status;
use crate::stitcher::Dataset;
use crate::window::TimeWindow;

use eval::{Evaluator, KNOWN_NAMES};
use parser::Token;
use rewrite::Rewritten;

/// One evaluated expression restricted to a window.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSeries {
    /// The expression as the caller wrote it
    pub name: String,
    pub timestamps: Vec<DateTime<Tz>>,
    pub values: Vec<Option<f64>>,
}

impl ResolvedSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of samples that carry a value.
    pub fn present(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// Evaluate `expression` over the rows of `dataset` inside `window`.
pub fn resolve(
    expression: &str,
    dataset: &Dataset,
    catalog: &ChannelCatalog,
    window: &TimeWindow,
    decode_status_channels: bool,
    tz: Tz,
) -> WelResult<ResolvedSeries> {
    let rewritten = rewrite::rewrite(expression, catalog, decode_status_channels);
    debug!("Resolving '{}' as {}", expression, rewritten);

    let fail = |reason: String| {
        let reason = match unknown_identifier_hint(&rewritten, catalog) {
            Some(hint) => format!("{}; {}", reason, hint),
            None => reason,
        };
        WelError::expression(expression, reason)
    };

    let parsed = parser::parse(&rewritten).map_err(fail)?;

    let rows = dataset.window_range(window);
    let mut channels = HashMap::new();
    for channel in rewritten.channels() {
        if channels.contains_key(channel) {
            continue;
        }
        let raw = dataset
            .values(&channel.name, rows.clone())
            .map_err(|e| WelError::expression(expression, e))?;
        let values = if channel.decode { decode_status(&raw) } else { raw };
        channels.insert(channel.clone(), values);
    }

    let timestamps_ms = &dataset.timestamps()[rows];
    let evaluator = Evaluator {
        timestamps: timestamps_ms,
        channels: &channels,
    };
    let values = evaluator.eval_series(&parsed).map_err(fail)?;

    let timestamps = timestamps_ms
        .iter()
        .map(|ms| {
            DateTime::from_timestamp_millis(*ms)
                .map(|dt| dt.with_timezone(&tz))
                .ok_or_else(|| WelError::expression(expression, format!("timestamp {} out of range", ms)))
        })
        .collect::<WelResult<Vec<_>>>()?;

    Ok(ResolvedSeries {
        name: expression.to_string(),
        timestamps,
        values,
    })
}

/// "did you mean ..." for the first identifier that is neither a channel nor a known
/// function or method.
fn unknown_identifier_hint(rewritten: &Rewritten, catalog: &ChannelCatalog) -> Option<String> {
    let tokens = parser::lex(rewritten).ok()?;
    let unknown = tokens.iter().find_map(|token| match token {
        Token::Ident(name) if !KNOWN_NAMES.contains(&name.as_str()) => Some(name.as_str()),
        _ => None,
    })?;
    match catalog.suggest(unknown, 1).into_iter().next() {
        Some(suggestion) => Some(format!("unknown channel '{}', did you mean '{}'?", unknown, suggestion)),
        None => Some(format!("unknown channel '{}'", unknown)),
    }
}
