use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::ChannelKind;
use crate::config::Config;
use crate::expr::ResolvedSeries;
use crate::partition::{ArchiveSource, YearMonth};
use crate::stitcher::DatasetStitcher;
use crate::window::{TimeWindow, WindowBound, WindowRequest};

/// Time range selection shared by every data command.
#[derive(Args, Debug, Clone, Default)]
pub struct WindowArgs {
    /// Start of the window (ISO-8601, local to the display timezone unless an offset is given, or "none")
    #[arg(long)]
    pub start: Option<String>,

    /// End of the window (ISO-8601 or "none")
    #[arg(long)]
    pub end: Option<String>,

    /// Last N hours through now; overrides --start/--end
    #[arg(long, conflicts_with_all = ["start", "end"])]
    pub hours: Option<f64>,
}

impl WindowArgs {
    pub fn request(&self) -> WindowRequest {
        if let Some(hours) = self.hours {
            return WindowRequest::LastHours(hours);
        }
        if self.start.is_none() && self.end.is_none() {
            return WindowRequest::Default;
        }
        let bound = |raw: &Option<String>| raw.as_deref().map_or(WindowBound::Unbounded, WindowBound::parse);
        WindowRequest::Range(bound(&self.start), bound(&self.end))
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

/// Build the stitcher, resolve the requested window and load it.
fn load_window(config: Config, window: &WindowArgs) -> Result<(DatasetStitcher, TimeWindow)> {
    let mut stitcher = DatasetStitcher::from_config(config).context("Failed to open data source")?;
    let resolved = stitcher
        .resolve_window(&window.request(), Utc::now())
        .context("Failed to resolve time window")?;
    info!("Window: {}", resolved);
    stitcher
        .ensure_coverage(&resolved)
        .with_context(|| format!("Failed to load data for {}", resolved))?;
    Ok((stitcher, resolved))
}

#[derive(Args)]
pub struct ChannelsCommand {
    /// Fuzzy filter on channel names
    #[arg(short, long)]
    pub filter: Option<String>,

    #[command(flatten)]
    pub window: WindowArgs,
}

impl ChannelsCommand {
    pub fn execute(self, config: Config) -> Result<()> {
        let (stitcher, _) = load_window(config, &self.window)?;
        let catalog = stitcher.catalog().ok_or_else(|| anyhow!("No dataset loaded"))?;

        let channels = catalog.filter(self.filter.as_deref().unwrap_or(""));
        println!(
            "\n📋 Channels from {} source ({} of {}):",
            stitcher.source_kind(),
            channels.len(),
            catalog.len()
        );
        println!("{:-<40}", "");
        for channel in channels {
            let marker = match channel.kind {
                ChannelKind::RawNumeric => "  ",
                ChannelKind::RawStatus => "🔘",
                ChannelKind::Derived => "🧮",
            };
            println!("{} {:<8} {}", marker, channel.kind.to_string(), channel.name);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct ResolveCommand {
    /// Channel names or expressions, e.g. "COP.rolling('6H').mean()"
    #[arg(required = true)]
    pub expressions: Vec<String>,

    #[command(flatten)]
    pub window: WindowArgs,

    /// Decode status channels to on (1) / off (missing)
    #[arg(short, long)]
    pub decode: bool,

    /// Blank samples where this status channel is off
    #[arg(short, long)]
    pub mask: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

impl ResolveCommand {
    pub fn execute(self, config: Config) -> Result<()> {
        let (stitcher, window) = load_window(config, &self.window)?;

        let mut resolved = Vec::with_capacity(self.expressions.len());
        for expression in &self.expressions {
            let series = match &self.mask {
                Some(mask) => stitcher.resolve_masked(expression, &window, self.decode, mask),
                None => stitcher.resolve(expression, &window, self.decode),
            }
            .with_context(|| format!("Failed to resolve '{}'", expression))?;
            if series.is_empty() {
                warn!("'{}' has no samples in {}", series.name, window);
            } else {
                info!("Resolved '{}': {} samples, {} present", series.name, series.len(), series.present());
            }
            resolved.push(series);
        }

        print_series(&resolved, &self.format)
    }
}

#[derive(Args)]
pub struct StatusCommand {
    #[command(flatten)]
    pub window: WindowArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

impl StatusCommand {
    pub fn execute(self, config: Config) -> Result<()> {
        let (stitcher, window) = load_window(config, &self.window)?;
        let overview = stitcher
            .status_overview(&window)
            .context("Failed to decode status channels")?;

        if overview.is_empty() {
            println!("⚠️  No status channels in {}", window);
            return Ok(());
        }

        match self.format {
            OutputFormat::Table => {
                println!("\n🔘 Status Overview {}:", window);
                println!("{:-<60}", "");
                for (idx, series) in overview.iter().enumerate() {
                    let total = series.len().max(1);
                    let on = series.present();
                    println!(
                        "  L{} {:<14} on {:>6} / {:<6} ({:.1}%)",
                        idx + 1,
                        series.name,
                        on,
                        series.len(),
                        on as f64 * 100.0 / total as f64
                    );
                }
                Ok(())
            }
            format => print_series(&overview, &format),
        }
    }
}

#[derive(Args)]
pub struct FetchCommand {
    /// First month to download, YYYY-MM
    #[arg(long)]
    pub from: String,

    /// Last month to download (inclusive), YYYY-MM; defaults to the current month
    #[arg(long)]
    pub to: Option<String>,

    /// Download again even when cached
    #[arg(long)]
    pub refresh: bool,
}

impl FetchCommand {
    pub fn execute(self, config: Config) -> Result<()> {
        let from = YearMonth::parse(&self.from).ok_or_else(|| anyhow!("--from '{}' is not YYYY-MM", self.from))?;
        let to = match &self.to {
            Some(raw) => YearMonth::parse(raw).ok_or_else(|| anyhow!("--to '{}' is not YYYY-MM", raw))?,
            None => YearMonth::containing(Utc::now(), config.source_offset()?),
        };
        if to < from {
            return Err(anyhow!("--to {} is before --from {}", to, from));
        }

        let archive = ArchiveSource::new(&config).context("Failed to set up archive cache")?;
        info!("Fetching {} through {} into {}", from, to, archive.cache_dir().display());
        let paths = archive
            .fetch_range(from, to, self.refresh)
            .context("Failed to fetch archive months")?;

        println!("\n🎉 Cached {} month(s) in {}", paths.len(), archive.cache_dir().display());
        Ok(())
    }
}

#[derive(Serialize)]
struct SeriesOutput<'a> {
    name: &'a str,
    timestamps: Vec<String>,
    values: &'a [Option<f64>],
}

/// All series share the window, so the first one's timestamps index every row.
fn print_series(series: &[ResolvedSeries], format: &OutputFormat) -> Result<()> {
    let Some(first) = series.first() else {
        return Ok(());
    };

    match format {
        OutputFormat::Json => {
            let output: Vec<SeriesOutput> = series
                .iter()
                .map(|s| SeriesOutput {
                    name: &s.name,
                    timestamps: s.timestamps.iter().map(|ts| ts.to_rfc3339()).collect(),
                    values: &s.values,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Csv => write_csv(series, std::io::stdout())?,
        OutputFormat::Table => {
            print!("{:<26}", "timestamp");
            for s in series {
                print!(" {:>16}", truncate(&s.name, 16));
            }
            println!();
            println!("{:-<width$}", "", width = 26 + 17 * series.len());
            for (row, ts) in first.timestamps.iter().enumerate() {
                print!("{:<26}", ts.format("%Y-%m-%d %H:%M:%S %Z"));
                for s in series {
                    match s.values.get(row).copied().flatten() {
                        Some(v) => print!(" {:>16.3}", v),
                        None => print!(" {:>16}", "-"),
                    }
                }
                println!();
            }
            println!("\n{} rows", first.len());
        }
    }
    Ok(())
}

/// One `timestamp` column followed by one column per series; missing samples are empty cells.
fn write_csv<W: std::io::Write>(series: &[ResolvedSeries], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    let mut header = vec!["timestamp".to_string()];
    header.extend(series.iter().map(|s| s.name.clone()));
    writer.write_record(&header)?;

    if let Some(first) = series.first() {
        for (row, ts) in first.timestamps.iter().enumerate() {
            let mut record = vec![ts.to_rfc3339()];
            record.extend(
                series
                    .iter()
                    .map(|s| s.values.get(row).copied().flatten().map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let kept: String = text.chars().take(width - 1).collect();
        format!("{}…", kept)
    }
}
