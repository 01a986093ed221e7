//! `logs` command backend: read, filter and follow a json-file log

use super::jsonfile::{rotated_path, LogRecord};
use crate::error::{Result, RuneError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub follow: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Only the last N records
    pub tail: Option<usize>,
    pub timestamps: bool,
}

/// Parse `--since`/`--until`: RFC 3339, unix seconds, or a duration ago
pub fn parse_time(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(secs) = raw.parse::<f64>() {
        let whole = secs.trunc() as i64;
        let nanos = ((secs.fract()) * 1e9) as u32;
        return DateTime::from_timestamp(whole, nanos)
            .ok_or_else(|| RuneError::usage(format!("invalid timestamp {:?}", raw)));
    }
    let ago = parse_duration(raw).ok_or_else(|| RuneError::usage(format!("invalid time {:?}", raw)))?;
    Ok(now - ago)
}

/// `1h30m`, `10m`, `42s`, `500ms`
fn parse_duration(raw: &str) -> Option<ChronoDuration> {
    let re = regex::Regex::new(r"(\d+)(ms|h|m|s)").expect("static regex");
    let mut total = ChronoDuration::zero();
    let mut consumed = 0;
    for cap in re.captures_iter(raw) {
        let n: i64 = cap[1].parse().ok()?;
        total += match &cap[2] {
            "h" => ChronoDuration::hours(n),
            "m" => ChronoDuration::minutes(n),
            "s" => ChronoDuration::seconds(n),
            _ => ChronoDuration::milliseconds(n),
        };
        consumed += cap[0].len();
    }
    (consumed == raw.len() && consumed > 0).then_some(total)
}

fn in_window(rec: &LogRecord, opts: &ReadOptions) -> bool {
    opts.since.map_or(true, |s| rec.time >= s) && opts.until.map_or(true, |u| rec.time <= u)
}

fn emit<O: Write, E: Write>(rec: &LogRecord, opts: &ReadOptions, out: &mut O, err: &mut E) -> Result<()> {
    let mut line = String::new();
    if opts.timestamps {
        line.push_str(&rec.time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
        line.push(' ');
    }
    line.push_str(&rec.log);
    if rec.stream == "stderr" {
        err.write_all(line.as_bytes())?;
        err.flush()?;
    } else {
        out.write_all(line.as_bytes())?;
        out.flush()?;
    }
    Ok(())
}

fn parse_lines(content: &str) -> impl Iterator<Item = LogRecord> + '_ {
    content.lines().filter_map(|l| serde_json::from_str(l).ok())
}

/// Rotated files oldest first, then the live file
fn log_files(path: &Path) -> Vec<std::path::PathBuf> {
    let mut rotated = Vec::new();
    let mut n = 1;
    while rotated_path(path, n).exists() {
        rotated.push(rotated_path(path, n));
        n += 1;
    }
    rotated.reverse();
    rotated.push(path.to_path_buf());
    rotated
}

/// Print the log at `path`; with `follow`, keep printing until `cancel`
pub async fn read_logs<O: Write, E: Write>(
    path: &Path,
    opts: &ReadOptions,
    out: &mut O,
    err: &mut E,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut records = Vec::new();
    for file in log_files(path) {
        match std::fs::read_to_string(&file) {
            Ok(content) => records.extend(parse_lines(&content).filter(|r| in_window(r, opts))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    let skip = opts.tail.map_or(0, |n| records.len().saturating_sub(n));
    for rec in &records[skip..] {
        emit(rec, opts, out, err)?;
    }
    if !opts.follow {
        return Ok(());
    }

    let mut offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }
        let len = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if len < offset {
            // Rotated or truncated underneath us.
            offset = 0;
        }
        if len == offset {
            continue;
        }
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            offset += n as u64;
            if let Ok(rec) = serde_json::from_str::<LogRecord>(&line) {
                if opts.until.is_some_and(|u| rec.time > u) {
                    return Ok(());
                }
                if in_window(&rec, opts) {
                    emit(&rec, opts, out, err)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::options::{LogConfig, LogDriver};
    use crate::logging::jsonfile::JsonFileWriter;

    #[test]
    fn test_parse_time_forms() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(parse_time("2024-01-01T11:00:00Z", now).unwrap(), now - ChronoDuration::hours(1));
        assert_eq!(parse_time("1h30m", now).unwrap(), now - ChronoDuration::minutes(90));
        assert_eq!(parse_time("1704110400", now).unwrap(), now);
        assert!(parse_time("yesterday", now).is_err());
        assert!(parse_time("10x", now).is_err());
    }

    #[tokio::test]
    async fn test_tail_and_streams_across_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        let config = LogConfig {
            driver: LogDriver::JsonFile,
            max_size: Some(200),
            max_file: 5,
        };
        let mut w = JsonFileWriter::open(&path, config).unwrap();
        for i in 0..6 {
            let stream = if i % 2 == 0 { "stdout" } else { "stderr" };
            w.write(stream, format!("line {}\n", i).as_bytes()).unwrap();
        }
        assert!(rotated_path(&path, 1).exists());

        let mut out = Vec::new();
        let mut err = Vec::new();
        let opts = ReadOptions::default();
        read_logs(&path, &opts, &mut out, &mut err, &CancellationToken::new()).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "line 0\nline 2\nline 4\n");
        assert_eq!(String::from_utf8(err).unwrap(), "line 1\nline 3\nline 5\n");

        let mut out = Vec::new();
        let mut err = Vec::new();
        let opts = ReadOptions { tail: Some(2), ..Default::default() };
        read_logs(&path, &opts, &mut out, &mut err, &CancellationToken::new()).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "line 4\n");
        assert_eq!(String::from_utf8(err).unwrap(), "line 5\n");
    }

    #[tokio::test]
    async fn test_follow_until_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        let mut w = JsonFileWriter::open(&path, LogConfig::default()).unwrap();
        w.write("stdout", b"first\n").unwrap();

        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            w.write("stdout", b"second\n").unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            c2.cancel();
        });

        let mut out = Vec::new();
        let mut err = Vec::new();
        let opts = ReadOptions { follow: true, timestamps: true, ..Default::default() };
        read_logs(&path, &opts, &mut out, &mut err, &cancel).await.unwrap();
        writer.await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" second"));
    }
}
