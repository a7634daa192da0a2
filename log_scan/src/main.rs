use std::{
    collections::HashMap,
    env,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Built-in report page; used whenever the config names no template file.
/// The renderer substitutes `$table_json` with the serialized rows.
const DEFAULT_TEMPLATE: &str = include_str!("report_template.html");

/// Runtime configuration, read from a JSON file. Every field has a default,
/// so a partial config file is fine; an unreadable or unparsable one makes
/// the caller fall back to `Config::default()` entirely.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    max_report_size: usize,
    logs_dir: PathBuf,
    reports_dir: PathBuf,
    log_name_prefix: String,
    compressed_suffix: String,
    errors_limit: Option<f64>,
    report_template: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_report_size: 1000,
            logs_dir: PathBuf::from("./log"),
            reports_dir: PathBuf::from("./reports"),
            log_name_prefix: "nginx-access-ui.log-".to_string(),
            compressed_suffix: "gz".to_string(),
            errors_limit: None,
            report_template: None,
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Per-line faults. Only `Encoding` is soft: the ingestor skips the line and
/// charges it to the error budget. A line that decodes but lacks one of the
/// two expected substrings aborts the whole run instead.
#[derive(Debug, Error)]
enum LineError {
    #[error("line is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("no quoted request path in line")]
    MissingPath,
    #[error("no request time in line")]
    MissingTime,
}

#[derive(Debug, Error)]
enum IngestError {
    #[error("errors limit exceeded: {errors} malformed of {processed} lines (limit {limit})")]
    ErrorsLimitExceeded {
        errors: u64,
        processed: u64,
        limit: f64,
    },
    #[error("unparsable line {line_no}: {source}")]
    Line {
        line_no: u64,
        #[source]
        source: LineError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One successfully parsed access-log line. The time stays a raw decimal
/// string; the aggregator parses it to a float.
#[derive(Debug, Clone, PartialEq)]
struct ParsedRecord {
    path: String,
    time: String,
}

/// Extracts the request path and time string from one raw log line.
///
/// Both fields are found by pattern search over the whole decoded line, not
/// by fixed-column slicing, so damaged surrounding fields are tolerated as
/// long as the two target substrings keep their shape. First match wins for
/// both; the time is the first `digits.digits` occurrence anywhere in the
/// line.
struct LineParser {
    path_re: Regex,
    time_re: Regex,
}

impl LineParser {
    fn new() -> Self {
        LineParser {
            path_re: Regex::new(r#""\S+ (\S+) \S+" "#).expect("path pattern is valid"),
            time_re: Regex::new(r"\d+\.\d+").expect("time pattern is valid"),
        }
    }

    fn parse(&self, line: &[u8]) -> Result<ParsedRecord, LineError> {
        let text = std::str::from_utf8(line)?;
        let path = self
            .path_re
            .captures(text)
            .and_then(|caps| caps.get(1))
            .ok_or(LineError::MissingPath)?
            .as_str()
            .to_string();
        let time = self
            .time_re
            .find(text)
            .ok_or(LineError::MissingTime)?
            .as_str()
            .to_string();
        Ok(ParsedRecord { path, time })
    }
}

/// Running malformed-vs-processed counters. The ratio is recomputed from
/// scratch after every line; strictly exceeding the configured limit is
/// fatal. With no limit configured the budget never trips.
struct ErrorBudget {
    limit: Option<f64>,
    processed: u64,
    errors: u64,
}

impl ErrorBudget {
    fn new(limit: Option<f64>) -> Self {
        ErrorBudget {
            limit,
            processed: 0,
            errors: 0,
        }
    }

    fn line_processed(&mut self) {
        self.processed += 1;
    }

    fn line_failed(&mut self) {
        self.errors += 1;
    }

    fn check(&self) -> Result<(), IngestError> {
        if let Some(limit) = self.limit {
            if self.processed > 0 && self.errors as f64 / self.processed as f64 > limit {
                return Err(IngestError::ErrorsLimitExceeded {
                    errors: self.errors,
                    processed: self.processed,
                    limit,
                });
            }
        }
        Ok(())
    }
}

/// True only when the final dot-separated component of the name equals the
/// configured suffix. Magic bytes are never inspected.
fn is_compressed(path: &Path, suffix: &str) -> bool {
    path.to_string_lossy().rsplit('.').next() == Some(suffix)
}

/// Reads the log at `path` to end-of-stream, parsing each line. Lines that
/// fail to decode are skipped and charged to the budget; the moment the
/// budget trips the whole read fails. Record order follows file order.
/// The handle is dropped on every exit path.
fn read_log_records(
    parser: &LineParser,
    path: &Path,
    compressed_suffix: &str,
    errors_limit: Option<f64>,
) -> Result<Vec<ParsedRecord>, IngestError> {
    let file = File::open(path)?;
    // split() instead of lines() so undecodable bytes reach the parser
    // rather than surfacing as an I/O error here.
    let reader: Box<dyn BufRead> = if is_compressed(path, compressed_suffix) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut budget = ErrorBudget::new(errors_limit);
    let mut records = Vec::new();
    let mut line_no: u64 = 0;
    for line in reader.split(b'\n') {
        let line = line?;
        line_no += 1;
        budget.line_processed();
        match parser.parse(&line) {
            Ok(record) => records.push(record),
            Err(LineError::Encoding(_)) => budget.line_failed(),
            Err(err) => {
                return Err(IngestError::Line {
                    line_no,
                    source: err,
                })
            }
        }
        budget.check()?;
    }
    Ok(records)
}

/// Per-path running totals, kept in first-seen order.
#[derive(Debug)]
struct PathStats {
    url: String,
    total_time: f64,
    count: u64,
    times: Vec<f64>,
}

/// One aggregated row of the final report. Percentages are shares of the
/// global totals, not of any per-path quantity.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct SummaryRow {
    url: String,
    count: u64,
    time_avg: f64,
    time_max: f64,
    time_sum: f64,
    time_med: f64,
    time_perc: f64,
    count_perc: f64,
}

/// The value whose absolute distance from the arithmetic mean is smallest;
/// ties keep the earliest occurrence. Not a true median, kept for report
/// continuity. Callers guarantee `times` is non-empty.
fn closest_to_mean(times: &[f64]) -> f64 {
    let mean = times.iter().sum::<f64>() / times.len() as f64;
    let mut best = times[0];
    let mut best_dist = (best - mean).abs();
    for &t in &times[1..] {
        let dist = (t - mean).abs();
        if dist < best_dist {
            best_dist = dist;
            best = t;
        }
    }
    best
}

/// Aggregates parsed records into summary rows, at most `max_records`
/// records deep.
///
/// Ordering inside the loop matters: global totals first, then the per-path
/// update, then the cap check. The record that reaches the cap is therefore
/// part of both the global totals and its path's stats, and nothing after
/// it is consumed. Row order equals path first-seen order.
fn create_report(records: &[ParsedRecord], max_records: usize) -> Result<Vec<SummaryRow>> {
    let mut total_records: u64 = 0;
    let mut total_time: f64 = 0.0;
    let mut stats: Vec<PathStats> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let time: f64 = record
            .time
            .parse()
            .with_context(|| format!("Bad request time value: {:?}", record.time))?;
        total_records += 1;
        total_time += time;
        match index.get(&record.path) {
            Some(&i) => {
                let entry = &mut stats[i];
                entry.count += 1;
                entry.total_time += time;
                entry.times.push(time);
            }
            None => {
                index.insert(record.path.clone(), stats.len());
                stats.push(PathStats {
                    url: record.path.clone(),
                    total_time: time,
                    count: 1,
                    times: vec![time],
                });
            }
        }
        if total_records >= max_records as u64 {
            break;
        }
    }

    let rows = stats
        .iter()
        .map(|s| SummaryRow {
            url: s.url.clone(),
            count: s.count,
            time_avg: s.total_time / s.count as f64,
            time_max: s.times.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            time_sum: s.total_time,
            time_med: closest_to_mean(&s.times),
            time_perc: 100.0 * s.total_time / total_time,
            count_perc: 100.0 * s.count as f64 / total_records as f64,
        })
        .collect();
    Ok(rows)
}

/// The input file picked for this run.
#[derive(Debug, Clone, PartialEq)]
struct LatestLogDescriptor {
    path: PathBuf,
    date: NaiveDate,
}

/// Scans `logs_dir` for names shaped `<prefix><8 digits>[.<suffix>]` and
/// returns the entry with the numerically largest embedded date, or `None`
/// when nothing matches. Only a strictly later date replaces the current
/// pick, so exact-date ties keep the earliest-encountered name. A winning
/// date that is not a real calendar date is an error, not a skip.
fn find_latest_log(
    logs_dir: &Path,
    prefix: &str,
    compressed_suffix: &str,
) -> Result<Option<LatestLogDescriptor>> {
    if !logs_dir.is_dir() {
        return Ok(None);
    }
    let pattern = format!(
        r"^{}(\d{{8}})(\.{})?$",
        regex::escape(prefix),
        regex::escape(compressed_suffix)
    );
    let name_re = Regex::new(&pattern).context("Failed to build log name pattern")?;

    let mut latest: Option<(u32, String)> = None;
    let entries = fs::read_dir(logs_dir)
        .with_context(|| format!("Failed to list logs dir: {}", logs_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(caps) = name_re.captures(name) else {
            continue;
        };
        let stamp: u32 = caps[1].parse()?;
        match &latest {
            Some((best, _)) if stamp <= *best => {}
            _ => latest = Some((stamp, name.to_string())),
        }
    }

    let Some((stamp, name)) = latest else {
        return Ok(None);
    };
    let (year, month, day) = (stamp / 10_000, stamp / 100 % 100, stamp % 100);
    let date = NaiveDate::from_ymd_opt(year as i32, month, day)
        .with_context(|| format!("{name}: {stamp:08} is not a calendar date"))?;
    Ok(Some(LatestLogDescriptor {
        path: logs_dir.join(name),
        date,
    }))
}

/// Substitutes `$table_json` in the template with the serialized rows and
/// writes the result, creating the parent directory if needed.
fn render_report(template: &str, rows: &[SummaryRow], out_path: &Path) -> Result<()> {
    let table_json = serde_json::to_string(rows).context("Failed to serialize report rows")?;
    let html = template.replace("$table_json", &table_json);
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create reports dir: {}", parent.display()))?;
    }
    fs::write(out_path, html)
        .with_context(|| format!("Failed to write report to {}", out_path.display()))?;
    Ok(())
}

fn run(config: &Config) -> Result<()> {
    let latest = find_latest_log(
        &config.logs_dir,
        &config.log_name_prefix,
        &config.compressed_suffix,
    )?;
    let Some(latest) = latest else {
        info!("no log files yet in {}", config.logs_dir.display());
        return Ok(());
    };

    let report_name = format!("report-{}.html", latest.date.format("%Y.%m.%d"));
    let report_path = config.reports_dir.join(report_name);
    if report_path.is_file() {
        info!(
            "report {} already exists, looks like everything is up to date",
            report_path.display()
        );
        return Ok(());
    }

    info!("collecting data from {}", latest.path.display());
    let parser = LineParser::new();
    let records = read_log_records(
        &parser,
        &latest.path,
        &config.compressed_suffix,
        config.errors_limit,
    )?;
    let rows = create_report(&records, config.max_report_size)?;
    if rows.is_empty() {
        info!("no log data yet, rendering an empty report");
    }

    let template = match &config.report_template {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read report template: {}", path.display()))?,
        None => DEFAULT_TEMPLATE.to_string(),
    };
    render_report(&template, &rows, &report_path)?;
    info!("report saved to {}", report_path.display());
    Ok(())
}

fn parse_args() -> Result<PathBuf> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let rest: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--config" => {
                let value = rest.get(i + 1).context("--config requires a file path")?;
                config_path = PathBuf::from(value);
                i += 2;
            }
            other => bail!(
                "Unknown argument: {other}\n\n\
                 Usage: log_scan [--config PATH]\n\n\
                 Options:\n  \
                 --config PATH    Config file path (default: {DEFAULT_CONFIG_PATH})"
            ),
        }
    }
    Ok(config_path)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    init_logging();

    let config_path = match parse_args() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!("falling back to the default config: {err:#}");
            Config::default()
        }
    };

    if let Err(err) = run(&config) {
        error!("run failed: {err:#}");
        std::process::exit(1);
    }
}
