use chrono::{DateTime, Utc};
use duckdb::Connection;
use polars::prelude::DataFrame;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{PartitionDescriptor, PartitionLocator, PartitionSource, SHIFTED_POWER_CHANNELS};
use crate::config::{Config, SourceKind};
use crate::error::{WelError, WelResult};
use crate::frame;
use crate::window::TimeWindow;

/// Column of UTC epoch seconds every live table is keyed by
pub const LIVE_TIMESTAMP_COLUMN: &str = "timestamp";

/// Samples written by the live logger into a DuckDB table. One query covers a whole window.
pub struct LiveSource {
    conn: Connection,
    table: String,
}

impl LiveSource {
    /// Open the database file named in the configuration
    pub fn new(config: &Config) -> WelResult<Self> {
        Self::open(&config.database_path, &config.database_table)
    }

    pub fn open<P: AsRef<Path>>(db_path: P, table: &str) -> WelResult<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path).map_err(|e| {
            WelError::partition(table, format!("cannot open database {}: {}", db_path.display(), e))
        })?;
        info!("🦆 Live source: table {} in {}", table, db_path.display());
        Ok(Self::from_connection(conn, table))
    }

    pub fn from_connection(conn: Connection, table: &str) -> Self {
        Self {
            conn,
            table: table.to_string(),
        }
    }

    /// Channel columns of the table in declaration order. Empty when the table does not exist.
    fn channel_columns(&self) -> duckdb::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name FROM information_schema.columns WHERE table_name = ? ORDER BY ordinal_position",
        )?;
        let rows = stmt.query_map(duckdb::params![self.table], |row| row.get::<_, String>(0))?;

        let mut columns = Vec::new();
        for row in rows {
            let name = row?;
            if name != LIVE_TIMESTAMP_COLUMN {
                columns.push(name);
            }
        }
        Ok(columns)
    }

    fn query_window(&self, label: &str, window: &TimeWindow) -> WelResult<DataFrame> {
        let columns = self
            .channel_columns()
            .map_err(|e| WelError::partition(label, format!("cannot read schema: {}", e)))?;
        if columns.is_empty() {
            return Err(WelError::partition(label, format!("table {} does not exist or has no channels", self.table)));
        }

        let select_list: Vec<String> = columns
            .iter()
            .map(|name| format!("TRY_CAST({} AS DOUBLE)", quote_ident(name)))
            .collect();
        let sql = format!(
            "SELECT {ts}, {cols} FROM {table} WHERE {ts} >= ? AND {ts} < ? ORDER BY {ts}",
            ts = quote_ident(LIVE_TIMESTAMP_COLUMN),
            cols = select_list.join(", "),
            table = quote_ident(&self.table),
        );

        // Half-open bound in milliseconds -> first whole second inside the bound
        let start_s = ceil_div(window.start_ms(), 1000);
        let end_s = ceil_div(window.end_ms(), 1000);

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| WelError::partition(label, format!("failed to prepare query: {}", e)))?;
        let width = columns.len();
        let rows = stmt
            .query_map(duckdb::params![start_s, end_s], |row| {
                let ts: i64 = row.get(0)?;
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(row.get::<_, Option<f64>>(idx + 1)?);
                }
                Ok((ts, values))
            })
            .map_err(|e| WelError::partition(label, format!("query failed: {}", e)))?;

        let mut timestamps = Vec::new();
        let mut data: Vec<Vec<Option<f64>>> = vec![Vec::new(); width];
        for row in rows {
            let (ts, values) = row.map_err(|e| WelError::partition(label, format!("bad row: {}", e)))?;
            timestamps.push(ts * 1000);
            for (slot, value) in data.iter_mut().zip(values) {
                slot.push(value.filter(|v| v.is_finite()));
            }
        }

        debug!("Queried {} samples from {} for {}", timestamps.len(), self.table, window);
        let mut df = frame::build_frame(timestamps, columns.into_iter().zip(data).collect())
            .map_err(|e| WelError::partition(label, format!("failed to build frame: {}", e)))?;
        frame::shift_back_one(&mut df, &SHIFTED_POWER_CHANNELS)
            .map_err(|e| WelError::partition(label, format!("failed to align power channels: {}", e)))?;
        Ok(df)
    }
}

impl PartitionSource for LiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    fn plan(&self, window: &TimeWindow, now: DateTime<Utc>) -> WelResult<Vec<PartitionDescriptor>> {
        Ok(vec![PartitionDescriptor {
            label: format!("{}{}", self.table, window),
            period: *window,
            locator: PartitionLocator::Query {
                table: self.table.clone(),
            },
            open: window.end() > now,
        }])
    }

    fn load(&self, partition: &PartitionDescriptor) -> WelResult<DataFrame> {
        match &partition.locator {
            PartitionLocator::Query { .. } => self.query_window(&partition.label, &partition.period),
            other => Err(WelError::partition(
                partition.label.clone(),
                format!("live source cannot load {:?}", other),
            )),
        }
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        let sql = format!(
            "SELECT MIN({ts}) FROM {table}",
            ts = quote_ident(LIVE_TIMESTAMP_COLUMN),
            table = quote_ident(&self.table)
        );
        match self.conn.query_row(&sql, [], |row| row.get::<_, Option<i64>>(0)) {
            Ok(Some(seconds)) => DateTime::from_timestamp(seconds, 0),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read earliest sample from {}: {}", self.table, e);
                None
            }
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn ceil_div(value: i64, divisor: i64) -> i64 {
    let quotient = value.div_euclid(divisor);
    if value.rem_euclid(divisor) == 0 {
        quotient
    } else {
        quotient + 1
    }
}
