use std::{
    env,
    fs::{self, File},
    io::Write,
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{Duration, FixedOffset, NaiveDate, TimeZone};
use flate2::{write::GzEncoder, Compression};

/// Where generated lines end up: a plain rotated log or a gzipped one.
enum LogSink {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl LogSink {
    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        match self {
            LogSink::Plain(file) => file.write_all(line)?,
            LogSink::Gzip(encoder) => encoder.write_all(line)?,
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        match self {
            LogSink::Plain(mut file) => file.flush()?,
            LogSink::Gzip(encoder) => {
                encoder.finish()?.flush()?;
            }
        }
        Ok(())
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Synthetic nginx ui access-log generator:
/// - Cycles through a few URLs, client IPs and response times.
/// - Writes one rotated log file named `<prefix><date>[.gz]`.
/// - Optionally salts in undecodable lines to exercise the error budget.
///
/// Environment variables:
/// - LOG_DIR: Output directory (default: ./log)
/// - LOG_NAME_PREFIX: Rotated file prefix (default: nginx-access-ui.log-)
/// - LOG_DATE: Embedded date as YYYYMMDD (default: today)
/// - NUM_LINES: How many lines to write (default: 1000)
/// - MALFORMED_EVERY: Every Nth line is broken bytes, 0 disables (default: 0)
/// - GZIP: "1" to gzip the output file (default: off)
fn main() -> Result<()> {
    let log_dir = PathBuf::from(env_or("LOG_DIR", "./log"));
    let prefix = env_or("LOG_NAME_PREFIX", "nginx-access-ui.log-");
    let date_stamp = env_or(
        "LOG_DATE",
        &chrono::Local::now().format("%Y%m%d").to_string(),
    );
    let num_lines: u64 = env_or("NUM_LINES", "1000")
        .parse()
        .context("NUM_LINES must be an integer")?;
    let malformed_every: u64 = env_or("MALFORMED_EVERY", "0")
        .parse()
        .context("MALFORMED_EVERY must be an integer")?;
    let gzip = matches!(env_or("GZIP", "0").as_str(), "1" | "true");

    let date = NaiveDate::parse_from_str(&date_stamp, "%Y%m%d")
        .with_context(|| format!("LOG_DATE must be a valid YYYYMMDD date, got {date_stamp:?}"))?;

    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log dir: {}", log_dir.display()))?;

    let file_name = if gzip {
        format!("{prefix}{date_stamp}.gz")
    } else {
        format!("{prefix}{date_stamp}")
    };
    let out_path = log_dir.join(&file_name);
    let file = File::create(&out_path)
        .with_context(|| format!("Failed to create log file: {}", out_path.display()))?;
    let mut sink = if gzip {
        LogSink::Gzip(GzEncoder::new(file, Compression::default()))
    } else {
        LogSink::Plain(file)
    };

    println!("fake_nginx starting...");
    println!("  Output file: {}", out_path.display());
    println!("  Lines: {num_lines}, malformed every: {malformed_every}");

    // A few example values to cycle through
    let urls: &[&str] = &[
        "/api/v2/banner/25019354",
        "/api/1/photogenic_banners/list/?server_name=WIN7RB4",
        "/api/v2/banner/16852664",
        "/api/v2/slot/4705/groups",
        "/api/v2/internal/banner/24294027/info",
        "/export/appinstall_raw/2017-06-29/",
    ];
    let ips: &[&str] = &["1.196.116.32", "1.99.174.176", "1.169.137.128", "1.200.76.128"];
    let times: &[f64] = &[0.133, 0.389, 1.163, 0.062, 2.451, 0.199];

    // One request per second starting at 10:00 local log time
    let tz = FixedOffset::east_opt(3 * 3600).context("log timezone offset")?;
    let start = tz
        .from_local_datetime(&date.and_hms_opt(10, 0, 0).context("start of log day")?)
        .single()
        .context("unambiguous start of log day")?;

    for i in 0..num_lines {
        if malformed_every > 0 && (i + 1) % malformed_every == 0 {
            sink.write_line(b"\xfa\x80 broken line that never decodes\n")?;
            continue;
        }

        let url = urls[(i as usize) % urls.len()];
        let ip = ips[(i as usize) % ips.len()];
        let request_time = times[(i as usize) % times.len()];
        let timestamp = (start + Duration::seconds(i as i64)).format("%d/%b/%Y:%H:%M:%S %z");
        let body_bytes = 200 + (i % 800);

        let line = format!(
            "{ip} -  - [{timestamp}] \"GET {url} HTTP/1.1\" 200 {body_bytes} \"-\" \"-\" \"-\" \"{date_stamp}-{i}\" \"-\" {request_time:.3}\n"
        );
        sink.write_line(line.as_bytes())?;

        if (i + 1) % 1000 == 0 {
            println!("  Wrote {} lines...", i + 1);
        }
    }

    sink.finish()?;
    println!("Done! Wrote {num_lines} lines to {}", out_path.display());

    Ok(())
}
