use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{WelError, WelResult};
use crate::partition::YearMonth;

/// Environment variable naming a config file used when `--config` is not given.
pub const CONFIG_ENV_VAR: &str = "WEL_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Monthly CSV exports, downloaded into a local cache
    Archive,
    /// DuckDB table written by the live logger
    Live,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Archive => write!(f, "archive"),
            SourceKind::Live => write!(f, "live"),
        }
    }
}

/// Everything the stitcher needs to know about where data lives and how to read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceKind,
    /// IANA timezone used for timestamps handed to callers
    pub display_timezone: String,
    /// Fixed offset the logger writes its Date/Time fields in, e.g. "-05:00"
    pub source_utc_offset: String,
    pub cache_dir: PathBuf,
    /// URL of a monthly export; `{year}` and `{month}` are substituted
    pub endpoint_template: String,
    /// First month the archive has data for, "YYYY-MM"
    pub archive_start: String,
    pub database_path: PathBuf,
    pub database_table: String,
    /// Status channels shown by the status overview, bottom to top
    pub status_channels: Vec<String>,
    pub download_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceKind::Archive,
            display_timezone: "America/New_York".to_string(),
            source_utc_offset: "-05:00".to_string(),
            cache_dir: PathBuf::from("wel_cache"),
            endpoint_template: "http://www.welserver.com/wel/data/{year}-{month}.csv".to_string(),
            archive_start: "2019-01".to_string(),
            database_path: PathBuf::from("wel_live.db"),
            database_table: "wel_samples".to_string(),
            status_channels: default_status_channels(),
            download_timeout_secs: 60,
        }
    }
}

fn default_status_channels() -> Vec<String> {
    [
        "heat_1_b",
        "heat_2_b",
        "rev_valve_b",
        "TAH_fan_b",
        "zone_1_b",
        "zone_2_b",
        "humid_b",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    /// Load configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the config file from an explicit path, then `WEL_CONFIG`, then defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_yaml_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Self::from_yaml_file(trimmed);
            }
        }
        debug!("No config file given, using defaults");
        Ok(Self::default())
    }

    /// Check every field that is parsed lazily so errors show up at startup.
    pub fn validate(&self) -> WelResult<()> {
        self.timezone()?;
        self.source_offset()?;
        self.archive_start_month()?;
        Ok(())
    }

    pub fn timezone(&self) -> WelResult<Tz> {
        self.display_timezone
            .parse::<Tz>()
            .map_err(|e| WelError::Config(format!("display_timezone '{}': {}", self.display_timezone, e)))
    }

    pub fn source_offset(&self) -> WelResult<FixedOffset> {
        parse_utc_offset(&self.source_utc_offset)
    }

    pub fn archive_start_month(&self) -> WelResult<YearMonth> {
        NaiveDate::parse_from_str(&format!("{}-01", self.archive_start.trim()), "%Y-%m-%d")
            .map(YearMonth::from_date)
            .map_err(|e| WelError::Config(format!("archive_start '{}': {}", self.archive_start, e)))
    }
}

/// Parse "+HH:MM", "-HH:MM", "+HHMM" or "Z".
pub fn parse_utc_offset(raw: &str) -> WelResult<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| WelError::Config("offset out of range".into()));
    }

    let invalid = || WelError::Config(format!("source_utc_offset '{}' is not ±HH:MM", raw));
    let (sign, rest) = match raw.chars().next() {
        Some('+') => (1, &raw[1..]),
        Some('-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
