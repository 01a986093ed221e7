//! Parsed `run`/`create` options
//!
//! The composer consumes [`CreateOptions`]; nothing below this module knows
//! about the CLI library.

use crate::error::{Result, RuneError};
use crate::image::{PullPolicy, VerifyMode};
use crate::network::resolvconf::DnsConfig;
use crate::network::{NetworkMode, PortMapping};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// `--restart` policy, stored in the daemon's restart labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    /// Retry count, 0 meaning unlimited
    OnFailure(u32),
}

impl std::str::FromStr for RestartPolicy {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure(0)),
            other => match other.strip_prefix("on-failure:") {
                Some(n) => n
                    .parse()
                    .map(RestartPolicy::OnFailure)
                    .map_err(|_| RuneError::usage(format!("invalid restart policy {:?}", other))),
                None => Err(RuneError::usage(format!("unsupported restart policy {:?}", other))),
            },
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure(0) => write!(f, "on-failure"),
            RestartPolicy::OnFailure(n) => write!(f, "on-failure:{}", n),
        }
    }
}

/// `--log-driver`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogDriver {
    #[default]
    JsonFile,
    None,
}

impl std::str::FromStr for LogDriver {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json-file" => Ok(LogDriver::JsonFile),
            "none" => Ok(LogDriver::None),
            other => Err(RuneError::usage(format!("unsupported log driver {:?}", other))),
        }
    }
}

/// Contents of `log-config.json` in the container state directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    pub driver: LogDriver,
    /// Rotate once the file would exceed this many bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    #[serde(default = "default_max_file")]
    pub max_file: u32,
}

fn default_max_file() -> u32 {
    1
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            driver: LogDriver::JsonFile,
            max_size: None,
            max_file: 1,
        }
    }
}

impl LogConfig {
    pub const FILE_NAME: &'static str = "log-config.json";

    /// Build from `--log-driver` and `--log-opt key=value` entries
    pub fn from_flags(driver: LogDriver, opts: &[String]) -> Result<Self> {
        let mut config = LogConfig { driver, ..Default::default() };
        for opt in opts {
            let (key, value) = opt
                .split_once('=')
                .ok_or_else(|| RuneError::usage(format!("invalid log option {:?}", opt)))?;
            match key {
                "max-size" => config.max_size = Some(parse_size(value)?),
                "max-file" => {
                    config.max_file = value
                        .parse()
                        .ok()
                        .filter(|n| *n >= 1)
                        .ok_or_else(|| RuneError::usage(format!("invalid max-file {:?}", value)))?;
                }
                other => return Err(RuneError::usage(format!("unknown log option {:?}", other))),
            }
        }
        Ok(config)
    }

    /// Read the config of a state directory; a missing file means defaults
    pub fn load(state_dir: &Path) -> Result<Self> {
        match std::fs::read(state_dir.join(Self::FILE_NAME)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `--cgroupns`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupnsMode {
    Private,
    Host,
}

impl CgroupnsMode {
    /// `private` on unified (v2) hosts, `host` otherwise
    pub fn host_default() -> Self {
        if Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            CgroupnsMode::Private
        } else {
            CgroupnsMode::Host
        }
    }
}

impl std::str::FromStr for CgroupnsMode {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(CgroupnsMode::Private),
            "host" => Ok(CgroupnsMode::Host),
            other => Err(RuneError::usage(format!("invalid cgroupns mode {:?}", other))),
        }
    }
}

/// `--ulimit name=soft[:hard]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

impl std::str::FromStr for Ulimit {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RuneError::usage(format!("invalid ulimit {:?}", s));
        let (name, limits) = s.split_once('=').ok_or_else(invalid)?;
        let parse = |v: &str| -> Result<u64> {
            if v == "-1" || v == "unlimited" {
                Ok(u64::MAX)
            } else {
                v.parse().map_err(|_| invalid())
            }
        };
        let (soft, hard) = match limits.split_once(':') {
            Some((s, h)) => (parse(s)?, parse(h)?),
            None => {
                let v = parse(limits)?;
                (v, v)
            }
        };
        if soft > hard {
            return Err(RuneError::usage(format!("ulimit {:?}: soft limit exceeds hard limit", s)));
        }
        Ok(Ulimit { name: name.to_string(), soft, hard })
    }
}

/// `--device host[:container][:perms]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub host: PathBuf,
    pub container: PathBuf,
    pub permissions: String,
}

impl std::str::FromStr for DeviceMapping {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        let is_perms = |p: &str| !p.is_empty() && p.chars().all(|c| matches!(c, 'r' | 'w' | 'm'));
        let parts: Vec<&str> = s.split(':').collect();
        let (host, container, perms) = match parts.as_slice() {
            [h] => (*h, *h, "rwm"),
            [h, p] if is_perms(p) => (*h, *h, *p),
            [h, c] => (*h, *c, "rwm"),
            [h, c, p] if is_perms(p) => (*h, *c, *p),
            _ => return Err(RuneError::usage(format!("invalid device {:?}", s))),
        };
        if !host.starts_with('/') || !container.starts_with('/') {
            return Err(RuneError::usage(format!("device paths must be absolute: {:?}", s)));
        }
        Ok(DeviceMapping {
            host: PathBuf::from(host),
            container: PathBuf::from(container),
            permissions: perms.to_string(),
        })
    }
}

/// Seccomp selection from `--security-opt seccomp=...`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SeccompProfile {
    #[default]
    Default,
    Unconfined,
    File(PathBuf),
}

/// Parsed `--security-opt` entries
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityOptions {
    pub seccomp: SeccompProfile,
    /// AppArmor profile name; `unconfined` disables it
    pub apparmor: Option<String>,
    pub no_new_privileges: bool,
}

impl SecurityOptions {
    pub fn parse(opts: &[String]) -> Result<Self> {
        let mut sec = SecurityOptions::default();
        for opt in opts {
            let (key, value) = match opt.split_once(|c: char| c == '=' || c == ':') {
                Some((k, v)) => (k, Some(v)),
                None => (opt.as_str(), None),
            };
            match (key, value) {
                ("seccomp", Some("unconfined")) => sec.seccomp = SeccompProfile::Unconfined,
                ("seccomp", Some(path)) => sec.seccomp = SeccompProfile::File(PathBuf::from(path)),
                ("apparmor", Some(profile)) => sec.apparmor = Some(profile.to_string()),
                ("no-new-privileges", None | Some("true")) => sec.no_new_privileges = true,
                ("no-new-privileges", Some("false")) => sec.no_new_privileges = false,
                _ => return Err(RuneError::usage(format!("unsupported security option {:?}", opt))),
            }
        }
        Ok(sec)
    }
}

/// Everything `run` and `create` accept
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Image reference, or a host directory with `rootfs`
    pub image: String,
    pub rootfs: bool,
    pub args: Vec<String>,
    /// `--entrypoint`; `Some("")` clears the image entrypoint
    pub entrypoint: Option<String>,

    pub name: Option<String>,
    pub hostname: Option<String>,
    pub workdir: Option<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub labels: Vec<String>,
    pub label_files: Vec<PathBuf>,

    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
    pub rm: bool,

    pub user: Option<String>,
    pub group_add: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub privileged: bool,
    pub security: SecurityOptions,

    pub volumes: Vec<String>,
    pub mounts: Vec<String>,
    pub tmpfs: Vec<String>,

    pub network: NetworkMode,
    pub publish: Vec<PortMapping>,
    pub dns: DnsConfig,
    pub ip: Option<IpAddr>,
    /// `--add-host host:ip`
    pub add_hosts: Vec<(String, String)>,

    pub cpus: Option<f64>,
    pub memory: Option<i64>,
    pub pids_limit: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub blkio_weight: Option<u16>,
    pub cgroupns: Option<CgroupnsMode>,
    pub ulimits: Vec<Ulimit>,
    pub oom_score_adj: Option<i32>,

    pub devices: Vec<DeviceMapping>,
    pub sysctls: BTreeMap<String, String>,
    pub shm_size: Option<u64>,
    pub read_only: bool,
    pub init: bool,
    pub init_binary: Option<String>,

    pub restart: RestartPolicy,
    pub log: LogConfig,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u32>,

    pub pull: PullPolicy,
    pub platform: Option<String>,
    pub runtime: Option<String>,
    pub verify: VerifyMode,
    pub cosign_key: Option<PathBuf>,

    pub cidfile: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
}

impl CreateOptions {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// Reject flag combinations that can never work
    pub fn validate(&self) -> Result<()> {
        if self.detach && self.tty {
            return Err(RuneError::TtyDetachConflict);
        }
        if self.detach && self.interactive {
            return Err(RuneError::InteractiveDetachConflict);
        }
        if self.rm && self.restart != RestartPolicy::No {
            return Err(RuneError::usage("flag --rm and --restart cannot be specified together"));
        }
        if let Some(cpus) = self.cpus {
            let host = num_cpus::get();
            if cpus <= 0.0 || cpus > host as f64 {
                return Err(RuneError::usage(format!(
                    "range of CPUs is from 0.01 to {}.00, as there are only {} CPUs available",
                    host, host
                )));
            }
        }
        if let Some(w) = self.blkio_weight {
            if w != 0 && !(10..=1000).contains(&w) {
                return Err(RuneError::usage("--blkio-weight must be between 10 and 1000"));
            }
        }
        if self.ip.is_some() && !matches!(self.network, NetworkMode::Bridge | NetworkMode::Networks(_)) {
            return Err(RuneError::usage("--ip requires a bridge or user network"));
        }
        if !self.publish.is_empty() && matches!(self.network, NetworkMode::None | NetworkMode::Host) {
            return Err(RuneError::usage("published ports are only supported on bridge or user networks"));
        }
        Ok(())
    }

    /// Environment in application order: env files first, then `-e`
    pub fn collect_env(&self) -> Result<Vec<String>> {
        let mut env = Vec::new();
        for file in &self.env_files {
            env.extend(read_kv_file(file, true)?);
        }
        for e in &self.env {
            env.extend(expand_host_env(e));
        }
        Ok(env)
    }

    /// User labels from `--label-file` then `--label`; later keys win
    pub fn collect_labels(&self) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        let mut entries = Vec::new();
        for file in &self.label_files {
            entries.extend(read_kv_file(file, false)?);
        }
        entries.extend(self.labels.iter().cloned());
        for entry in entries {
            let (k, v) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            labels.insert(k.to_string(), v.to_string());
        }
        Ok(labels)
    }
}

/// `KEY` alone takes its value from the host environment, and is dropped
/// when the host has none
fn expand_host_env(entry: &str) -> Option<String> {
    if entry.contains('=') {
        return Some(entry.to_string());
    }
    std::env::var(entry).ok().map(|v| format!("{}={}", entry, v))
}

/// Read a `KEY=VALUE` per line file, skipping blanks and `#` comments
pub fn read_kv_file(path: &Path, host_fallback: bool) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| RuneError::usage(format!("failed to read {}: {}", path.display(), e)))?;
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if host_fallback {
            out.extend(expand_host_env(line));
        } else {
            out.push(line.to_string());
        }
    }
    Ok(out)
}

/// Parse `512`, `64k`, `42m`, `1g` (binary multiples) into bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let invalid = || RuneError::usage(format!("invalid size {:?}", s));
    let lower = s.trim().to_ascii_lowercase();
    let digits_end = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (num, unit) = lower.split_at(digits_end);
    let value: f64 = num.parse().map_err(|_| invalid())?;
    let mult: u64 = match unit.trim_end_matches('b').trim_end_matches('i') {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => return Err(invalid()),
    };
    if value < 0.0 {
        return Err(invalid());
    }
    Ok((value * mult as f64) as u64)
}

/// Parse `--add-host host:ip`
pub fn parse_add_host(s: &str) -> Result<(String, String)> {
    let (host, ip) = s
        .split_once(':')
        .ok_or_else(|| RuneError::usage(format!("invalid --add-host {:?}: expected host:ip", s)))?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    ip.parse::<IpAddr>()
        .map_err(|_| RuneError::usage(format!("invalid IP address in --add-host {:?}", s)))?;
    Ok((host.to_string(), ip.to_string()))
}

/// Parse a signal given as `SIGTERM`, `TERM` or `15`
pub fn parse_signal(s: &str) -> Result<u32> {
    if let Ok(n) = s.parse::<u32>() {
        if (1..=64).contains(&n) {
            return Ok(n);
        }
    }
    let name = s.to_ascii_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let sig = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ILL" => libc::SIGILL,
        "TRAP" => libc::SIGTRAP,
        "ABRT" => libc::SIGABRT,
        "BUS" => libc::SIGBUS,
        "FPE" => libc::SIGFPE,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "SEGV" => libc::SIGSEGV,
        "USR2" => libc::SIGUSR2,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        "URG" => libc::SIGURG,
        "XCPU" => libc::SIGXCPU,
        "XFSZ" => libc::SIGXFSZ,
        "VTALRM" => libc::SIGVTALRM,
        "PROF" => libc::SIGPROF,
        "WINCH" => libc::SIGWINCH,
        "IO" => libc::SIGIO,
        "PWR" => libc::SIGPWR,
        "SYS" => libc::SIGSYS,
        _ => return Err(RuneError::usage(format!("invalid signal {:?}", s))),
    };
    Ok(sig as u32)
}
