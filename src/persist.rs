//! Text-line persistence for cached hosts.
//!
//! One host per line: `<addr>:<port> <utc-timestamp>`. Interpretation of
//! the timestamp (clamping of stale or future entries) is the cache's
//! business; this module only reads and writes lines.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

use crate::host::Host;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

pub fn format_timestamp(unix_secs: u64) -> String {
    match DateTime::<Utc>::from_timestamp(unix_secs as i64, 0) {
        Some(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        None => format_timestamp(0),
    }
}

pub fn parse_timestamp(text: &str) -> Option<u64> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT).ok()?;
    let secs = naive.and_utc().timestamp();
    u64::try_from(secs).ok()
}

/// Read host lines from `path`.
///
/// A missing file is an empty cache, not an error. Lines whose host part
/// does not parse are skipped; a host with a malformed or absent timestamp
/// is returned with `None` so the caller can clamp it.
pub fn read_hosts(path: &Path) -> Result<Vec<(Host, Option<u64>)>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };

    let mut hosts = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (host_part, rest) = match line.split_once(char::is_whitespace) {
            Some((h, r)) => (h, Some(r)),
            None => (line, None),
        };
        let host: Host = match host_part.parse() {
            Ok(h) => h,
            Err(_) => {
                debug!(line, "skipping unparsable host line");
                continue;
            }
        };

        hosts.push((host, rest.and_then(parse_timestamp)));
    }
    Ok(hosts)
}

/// Write host lines to `path`, replacing it atomically.
///
/// The data goes to a sibling temp file first and is renamed into place,
/// so a crash mid-write never truncates the previous cache.
pub fn write_hosts<I>(path: &Path, hosts: I) -> Result<()>
where
    I: IntoIterator<Item = (Host, u64)>,
{
    let tmp = path.with_extension("new");
    {
        let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        let mut out = BufWriter::new(file);
        for (host, added) in hosts {
            writeln!(out, "{} {}", host, format_timestamp(added))
                .with_context(|| format!("writing {}", tmp.display()))?;
        }
        out.flush().context("flushing host file")?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}
