//! Output shapes for `ps`, `inspect` and `port`

use super::lifecycle::ContainerView;
use crate::daemon::TaskStatus;
use crate::error::{Result, RuneError};
use crate::network::PortMapping;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

const COMMAND_WIDTH: usize = 20;

/// One `ps` row; field names are the `--format` placeholders
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PsRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub image: String,
    pub command: String,
    pub created_at: String,
    pub running_for: String,
    pub status: String,
    pub state: String,
    pub ports: String,
    pub names: String,
    pub labels: String,
}

/// Docker's coarse "how long" phrasing
pub fn human_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        0 => "Less than a second".to_string(),
        1 => "1 second".to_string(),
        s if s < 60 => format!("{} seconds", s),
        s if s < 120 => "About a minute".to_string(),
        s if s < 3600 => format!("{} minutes", s / 60),
        s if s < 7200 => "About an hour".to_string(),
        s if s < 48 * 3600 => format!("{} hours", s / 3600),
        s if s < 14 * 86400 => format!("{} days", s / 86400),
        s if s < 60 * 86400 => format!("{} weeks", s / (7 * 86400)),
        s if s < 2 * 365 * 86400 => format!("{} months", s / (30 * 86400)),
        s => format!("{} years", s / (365 * 86400)),
    }
}

fn status_text(view: &ContainerView, now: DateTime<Utc>) -> (String, String) {
    match &view.task {
        None => ("Created".to_string(), "created".to_string()),
        Some(t) => match t.status {
            TaskStatus::Running => ("Up".to_string(), "running".to_string()),
            TaskStatus::Paused | TaskStatus::Pausing => ("Up (Paused)".to_string(), "paused".to_string()),
            TaskStatus::Created => ("Created".to_string(), "created".to_string()),
            TaskStatus::Stopped => {
                let code = t.exit_status.unwrap_or_default();
                let text = match t.exited_at {
                    Some(at) => format!("Exited ({}) {} ago", code, human_duration(now - at)),
                    None => format!("Exited ({})", code),
                };
                (text, "exited".to_string())
            }
            TaskStatus::Unknown => ("Unknown".to_string(), "unknown".to_string()),
        },
    }
}

/// Init process argv as stored in the runtime spec
fn command_args(view: &ContainerView) -> Vec<String> {
    view.record
        .spec
        .as_ref()
        .and_then(|s| s.pointer("/process/args"))
        .and_then(|a| serde_json::from_value(a.clone()).ok())
        .unwrap_or_default()
}

fn ports_text(ports: &[PortMapping]) -> String {
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

pub fn ps_row(view: &ContainerView, no_trunc: bool, now: DateTime<Utc>) -> PsRow {
    let mut command = command_args(view).join(" ");
    if !no_trunc && command.chars().count() > COMMAND_WIDTH {
        command = command.chars().take(COMMAND_WIDTH - 1).collect::<String>() + "…";
    }
    let id = if no_trunc { view.id().to_string() } else { view.id().chars().take(12).collect() };
    let created = view.record.created_at.unwrap_or(now);
    let (status, state) = status_text(view, now);
    let mut labels: Vec<String> = view
        .record
        .labels
        .iter()
        .filter(|(k, _)| !k.starts_with(super::labels::PREFIX) && !k.starts_with("containerd.io/"))
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    labels.sort();

    PsRow {
        id,
        image: view.record.image.clone(),
        command: format!("\"{}\"", command),
        created_at: created.format("%Y-%m-%d %H:%M:%S %z %Z").to_string(),
        running_for: format!("{} ago", human_duration(now - created)),
        status,
        state,
        ports: ports_text(&view.labels.ports),
        names: view.name().to_string(),
        labels: labels.join(","),
    }
}

/// Pad tab-separated cells into aligned columns
pub fn tabulate(rows: &[Vec<String>]) -> String {
    let cols = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    let mut widths = vec![0; cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            line.push_str(cell);
            if i + 1 < row.len() {
                line.push_str(&" ".repeat(widths[i] - cell.chars().count() + 3));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn placeholder_re() -> Regex {
    Regex::new(r"\{\{\s*(json\s+)?\.([A-Za-z]*)\s*\}\}").expect("static regex")
}

/// Render a `--format` template against a serialized row.
///
/// Supports `{{.Field}}`, `{{json .Field}}` and `{{json .}}`.
pub fn render_template(template: &str, row: &Value) -> Result<String> {
    let re = placeholder_re();
    let mut out = String::new();
    let mut last = 0;
    for cap in re.captures_iter(template) {
        let whole = cap.get(0).map_or(0..0, |m| m.range());
        out.push_str(&template[last..whole.start]);
        last = whole.end;

        let field = &cap[2];
        let value = if field.is_empty() {
            row
        } else {
            row.get(field)
                .ok_or_else(|| RuneError::usage(format!("template: can't evaluate field {}", field)))?
        };
        if cap.get(1).is_some() {
            out.push_str(&serde_json::to_string(value)?);
        } else {
            match value {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
    }
    out.push_str(&template[last..]);
    Ok(out.replace("\\t", "\t").replace("\\n", "\n"))
}

/// Header cell for a placeholder, Docker style
fn header_for(field: &str, titles: &[(&str, &str)]) -> String {
    if let Some((_, title)) = titles.iter().find(|(f, _)| *f == field) {
        return title.to_string();
    }
    match field {
        "ID" => "CONTAINER ID".to_string(),
        "CreatedAt" => "CREATED AT".to_string(),
        "RunningFor" | "CreatedSince" => "CREATED".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

/// Render rows through `format`: the default table when `None`, a table with
/// header when prefixed with `table`, otherwise one rendered line per row
pub fn render_rows<T: Serialize>(rows: &[T], format: Option<&str>, default_table: &str) -> Result<String> {
    render_rows_titled(rows, format, default_table, &[])
}

/// [`render_rows`] with header overrides as `(field, title)` pairs
pub fn render_rows_titled<T: Serialize>(
    rows: &[T],
    format: Option<&str>,
    default_table: &str,
    titles: &[(&str, &str)],
) -> Result<String> {
    let (template, table) = match format {
        None => (default_table, true),
        Some(f) => match f.strip_prefix("table") {
            Some(rest) => (rest.trim_start(), true),
            None => (f, false),
        },
    };
    let mut lines: Vec<String> = Vec::new();
    if table {
        let header = placeholder_re().replace_all(template, |c: &regex::Captures| header_for(&c[2], titles));
        lines.push(header.replace("\\t", "\t"));
    }
    for row in rows {
        lines.push(render_template(template, &serde_json::to_value(row)?)?);
    }
    if !table {
        return Ok(lines.iter().map(|l| format!("{}\n", l)).collect());
    }
    let cells: Vec<Vec<String>> = lines
        .iter()
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect();
    Ok(tabulate(&cells))
}

pub const PS_TABLE: &str =
    "{{.ID}}\t{{.Image}}\t{{.Command}}\t{{.RunningFor}}\t{{.Status}}\t{{.Ports}}\t{{.Names}}";

/// `ps` output for `views`
pub fn ps(views: &[ContainerView], quiet: bool, no_trunc: bool, format: Option<&str>) -> Result<String> {
    let now = Utc::now();
    let rows: Vec<PsRow> = views.iter().map(|v| ps_row(v, no_trunc, now)).collect();
    if quiet {
        return Ok(rows.iter().map(|r| format!("{}\n", r.id)).collect());
    }
    render_rows(&rows, format, PS_TABLE)
}

/// Docker-shaped `inspect` document of one container
pub fn inspect(view: &ContainerView) -> Value {
    let args = command_args(view);
    let (path, rest) = match args.split_first() {
        Some((p, r)) => (p.clone(), r.to_vec()),
        None => (String::new(), Vec::new()),
    };
    let (_, state) = status_text(view, Utc::now());
    let task = view.task.as_ref();
    let process = view.record.spec.as_ref().and_then(|s| s.get("process"));

    let mut ports = serde_json::Map::new();
    for p in &view.labels.ports {
        let key = format!("{}/{}", p.container_port, p.protocol);
        let binding = json!({
            "HostIp": if p.host_ip.is_empty() { "0.0.0.0" } else { p.host_ip.as_str() },
            "HostPort": p.host_port.to_string(),
        });
        match ports.get_mut(&key) {
            Some(Value::Array(list)) => list.push(binding),
            _ => {
                ports.insert(key, Value::Array(vec![binding]));
            }
        }
    }

    json!({
        "Id": view.id(),
        "Created": view.record.created_at,
        "Path": path,
        "Args": rest,
        "State": {
            "Status": state,
            "Running": matches!(task.map(|t| t.status), Some(TaskStatus::Running)),
            "Paused": matches!(task.map(|t| t.status), Some(TaskStatus::Paused)),
            "Pid": task.map(|t| t.pid).unwrap_or_default(),
            "ExitCode": task.and_then(|t| t.exit_status).unwrap_or_default(),
            "FinishedAt": task.and_then(|t| t.exited_at),
        },
        "Image": view.record.image,
        "Name": format!("/{}", view.name()),
        "Driver": view.record.snapshotter,
        "Platform": view.labels.platform,
        "LogPath": if view.labels.log_uri.is_some() {
            Some(format!("{}/{}-json.log", view.labels.state_dir, view.id()))
        } else {
            None
        },
        "Mounts": view.labels.mounts,
        "Config": {
            "Hostname": view.labels.hostname,
            "Env": process.and_then(|p| p.get("env")).cloned().unwrap_or(Value::Null),
            "Cmd": args,
            "WorkingDir": process.and_then(|p| p.get("cwd")).cloned().unwrap_or(Value::Null),
            "Tty": process.and_then(|p| p.get("terminal")).cloned().unwrap_or(Value::Bool(false)),
            "Image": view.record.image,
            "Labels": view.record.labels,
            "StopSignal": view.labels.stop_signal,
        },
        "HostConfig": {
            "NetworkMode": view.labels.networks.join(","),
            "Runtime": view.record.runtime,
            "ExtraHosts": view.labels.extra_hosts,
            "AutoRemove": view.labels.auto_remove,
        },
        "NetworkSettings": {
            "Ports": ports,
        },
    })
}

/// `port` lines, optionally filtered by `PORT[/PROTO]`
pub fn port_lines(ports: &[PortMapping], filter: Option<&str>) -> Result<Vec<String>> {
    let wanted = match filter {
        None => None,
        Some(f) => {
            let (port, proto) = f.split_once('/').unwrap_or((f, "tcp"));
            let port: u16 = port
                .parse()
                .map_err(|_| RuneError::usage(format!("invalid port {:?}", f)))?;
            Some((port, proto.to_ascii_lowercase()))
        }
    };
    let lines: Vec<String> = ports
        .iter()
        .filter(|p| {
            wanted
                .as_ref()
                .map_or(true, |(port, proto)| p.container_port == *port && &p.protocol == proto)
        })
        .map(|p| {
            let ip = if p.host_ip.is_empty() { "0.0.0.0" } else { &p.host_ip };
            match filter {
                Some(_) => format!("{}:{}", ip, p.host_port),
                None => format!("{}/{} -> {}:{}", p.container_port, p.protocol, ip, p.host_port),
            }
        })
        .collect();
    if filter.is_some() && lines.is_empty() {
        return Err(RuneError::usage(format!(
            "no public port '{}' published",
            filter.unwrap_or_default()
        )));
    }
    Ok(lines)
}
