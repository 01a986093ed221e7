//! OCI hook mode
//!
//! The runtime re-executes this binary as `runectl oci-hook <event> ...`
//! with the container state on stdin. `createRuntime` wires the container
//! into its networks; `postStop` takes it out again.

use crate::container::spec::{apparmor_enabled, DEFAULT_APPARMOR_PROFILE};
use crate::error::{ignore_not_found, Result, RuneError};
use crate::network::cni::netns_path;
use crate::network::resolvconf::{self, DnsConfig};
use crate::network::{Attachment, CniRunner, NetworkConfig, NetworkManager, PortMapping};
use crate::runtime::{bind_private, unmount_detach};
use crate::storage::{DataStore, HostsStore};
use clap::Parser;
use oci_spec::runtime::Spec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// First argument that selects hook mode
pub const HOOK_COMMAND: &str = "oci-hook";

const APPARMOR_PROFILES: &str = "/sys/kernel/security/apparmor/profiles";

/// Flags baked into the runtime spec at create time
#[derive(Parser, Debug, Clone)]
#[command(name = "oci-hook")]
pub struct HookArgs {
    /// `createRuntime` or `postStop`
    pub event: String,
    #[arg(long)]
    pub full_id: String,
    #[arg(long)]
    pub container_state_dir: PathBuf,
    #[arg(long)]
    pub data_store: PathBuf,
    #[arg(long)]
    pub namespace: String,
    #[arg(long, default_value = crate::config::DEFAULT_CNI_PATH)]
    pub cni_path: String,
    #[arg(long, default_value = crate::config::DEFAULT_CNI_NETCONFPATH)]
    pub cni_netconfpath: PathBuf,
    #[arg(long = "network")]
    pub networks: Vec<String>,
    #[arg(long)]
    pub dns: Vec<String>,
    #[arg(long)]
    pub dns_search: Vec<String>,
    #[arg(long)]
    pub dns_option: Vec<String>,
    /// Published ports, one JSON mapping each
    #[arg(long = "p")]
    pub ports: Vec<String>,
    #[arg(long)]
    pub ip: Option<IpAddr>,
}

impl HookArgs {
    /// Log file for this event inside the state directory
    pub fn log_path(&self) -> PathBuf {
        self.container_state_dir.join(format!("oci-hook.{}.log", self.event))
    }

    fn plugin_managed(&self) -> bool {
        !self.networks.is_empty() && !self.networks.iter().any(|n| n == "none" || n == "host")
    }

    fn dns(&self) -> DnsConfig {
        DnsConfig {
            servers: self.dns.clone(),
            search: self.dns_search.clone(),
            options: self.dns_option.clone(),
        }
    }

    fn port_mappings(&self) -> Result<Vec<PortMapping>> {
        self.ports
            .iter()
            .map(|p| serde_json::from_str(p).map_err(RuneError::from))
            .collect()
    }
}

/// Container state the runtime writes on our stdin
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeState {
    pub id: String,
    #[serde(default)]
    pub pid: u32,
    pub bundle: PathBuf,
}

/// Root filesystem path from `<bundle>/config.json`
fn rootfs_path(bundle: &Path) -> Result<PathBuf> {
    let raw = std::fs::read(bundle.join("config.json"))?;
    let spec: Spec = serde_json::from_slice(&raw)?;
    let root = spec
        .root()
        .as_ref()
        .map(|r| r.path().clone())
        .ok_or_else(|| RuneError::InvalidConfig("bundle config has no root".into()))?;
    Ok(if root.is_absolute() { root } else { bundle.join(root) })
}

/// Run one hook event
pub async fn run(args: &HookArgs, state: &RuntimeState) -> Result<()> {
    let rootfs = rootfs_path(&state.bundle)?;
    debug!("{} for {} (pid {}, rootfs {})", args.event, state.id, state.pid, rootfs.display());
    match args.event.as_str() {
        "createRuntime" => create_runtime(args, state, &rootfs).await,
        "postStop" => post_stop(args, state, &rootfs).await,
        other => Err(RuneError::usage(format!("unexpected hook event {:?}", other))),
    }
}

fn attachments(args: &HookArgs) -> Result<Vec<NetworkConfig>> {
    NetworkManager::new(&args.cni_netconfpath).resolve_attachment(&args.networks)
}

async fn create_runtime(args: &HookArgs, state: &RuntimeState, rootfs: &Path) -> Result<()> {
    if !args.plugin_managed() {
        return Ok(());
    }
    if let Err(e) = ensure_apparmor_profile().await {
        warn!("failed to load AppArmor profile: {}", e);
    }

    // resolv.conf, bound over the image's own file
    let generated = resolvconf::write(&args.container_state_dir, &args.dns())?;
    let target = rootfs.join("etc/resolv.conf");
    if !target.exists() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&target)?;
    }
    bind_private(&generated, &target)?;

    let networks = attachments(args)?;
    let attach: Vec<Attachment> = networks
        .into_iter()
        .enumerate()
        .map(|(i, network)| Attachment {
            network,
            ip: if i == 0 { args.ip } else { None },
        })
        .collect();
    let data = DataStore::new(&args.data_store);
    let runner = CniRunner::new(&args.cni_path, data.network_results_dir(&args.namespace, &state.id));
    let results = runner
        .setup(&args.full_id, &netns_path(state.pid), &attach, &args.port_mappings()?)
        .await?;

    let addresses: BTreeMap<String, String> = results
        .iter()
        .filter_map(|r| r.ips.first().map(|ip| (r.network.clone(), ip.clone())))
        .collect();
    ignore_not_found(HostsStore::open(&data, &args.namespace)?.set_networks(&state.id, addresses))?;
    info!("container {} attached to {} network(s)", state.id, results.len());
    Ok(())
}

async fn post_stop(args: &HookArgs, state: &RuntimeState, rootfs: &Path) -> Result<()> {
    if !args.plugin_managed() {
        return Ok(());
    }
    let data = DataStore::new(&args.data_store);
    let results_dir = data.network_results_dir(&args.namespace, &state.id);

    match attachments(args) {
        Ok(networks) => {
            let runner = CniRunner::new(&args.cni_path, &results_dir);
            // The process is gone; plugins only need the id to release state.
            if let Err(e) = runner.remove(&args.full_id, &netns_path(state.pid), &networks).await {
                warn!("failed to detach {}: {}", state.id, e);
            }
        }
        Err(e) => warn!("cannot resolve networks of {}: {}", state.id, e),
    }

    if let Err(e) = unmount_detach(&rootfs.join("etc/resolv.conf")) {
        debug!("unmount resolv.conf: {}", e);
    }
    if let Err(e) = ignore_not_found(std::fs::remove_dir_all(&results_dir).map_err(RuneError::from)) {
        warn!("failed to remove {}: {}", results_dir.display(), e);
    }
    ignore_not_found(HostsStore::open(&data, &args.namespace)?.set_networks(&state.id, BTreeMap::new()))?;
    info!("container {} detached", state.id);
    Ok(())
}

const APPARMOR_TEMPLATE: &str = r#"#include <tunables/global>

profile runectl-default flags=(attach_disconnected,mediate_deleted) {
  #include <abstractions/base>

  network,
  capability,
  file,
  umount,
  signal (receive) peer=unconfined,
  signal (send,receive) peer=runectl-default,

  deny @{PROC}/* w,
  deny @{PROC}/{[^1-9],[^1-9][^0-9],[^1-9s][^0-9y][^0-9s],[^1-9][^0-9][^0-9][^0-9]*}/** w,
  deny @{PROC}/sys/[^k]** w,
  deny @{PROC}/sys/kernel/{?,??,[^s][^h][^m]**} w,
  deny @{PROC}/sysrq-trigger rwklx,
  deny @{PROC}/kcore rwklx,
  deny mount,
  deny /sys/[^f]*/** wklx,
  deny /sys/f[^s]*/** wklx,
  deny /sys/fs/[^c]*/** wklx,
  deny /sys/fs/c[^g]*/** wklx,
  deny /sys/fs/cg[^r]*/** wklx,
  deny /sys/firmware/** rwklx,
  deny /sys/kernel/security/** rwklx,

  ptrace (trace,read,tracedby,readby) peer=runectl-default,
}
"#;

/// Load the default profile unless the kernel already has it
async fn ensure_apparmor_profile() -> Result<()> {
    if !apparmor_enabled() {
        return Ok(());
    }
    let loaded = std::fs::read_to_string(APPARMOR_PROFILES).unwrap_or_default();
    if loaded.lines().any(|l| l.split_whitespace().next() == Some(DEFAULT_APPARMOR_PROFILE)) {
        return Ok(());
    }

    let mut child = Command::new("apparmor_parser")
        .args(["-Kr"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use tokio::io::AsyncWriteExt;
        stdin.write_all(APPARMOR_TEMPLATE.as_bytes()).await?;
    }
    let out = child.wait_with_output().await?;
    if !out.status.success() {
        return Err(RuneError::Internal(format!(
            "apparmor_parser: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    info!("loaded AppArmor profile {}", DEFAULT_APPARMOR_PROFILE);
    Ok(())
}

/// Open the hook log named by a hook argv for appending.
///
/// Used to attach the log before tracing is set up; `None` when the
/// arguments do not parse or the state dir is gone.
pub fn open_log(argv: &[String]) -> Option<std::fs::File> {
    let args = HookArgs::try_parse_from(argv).ok()?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(args.log_path())
        .ok()
}

/// Hook process entry: parse argv, read the state, run, log the outcome
pub async fn main(argv: Vec<String>) -> anyhow::Result<()> {
    use anyhow::Context;

    let args = HookArgs::try_parse_from(argv).context("parsing hook arguments")?;
    let mut raw = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut raw).context("reading runtime state")?;
    let state: RuntimeState = serde_json::from_str(&raw).context("decoding runtime state")?;

    let res = run(&args, &state).await;
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(args.log_path()) {
        let outcome = match &res {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("error: {}", e),
        };
        if let Err(e) = writeln!(f, "{} {} {}: {}", chrono::Utc::now().to_rfc3339(), args.event, state.id, outcome) {
            warn!("failed to append to {}: {}", args.log_path().display(), e);
        }
    }
    res.with_context(|| format!("{} hook for {}", args.event, state.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(dir: &Path) -> PathBuf {
        let bundle = dir.join("bundle");
        std::fs::create_dir_all(bundle.join("rootfs/etc")).unwrap();
        std::fs::write(
            bundle.join("config.json"),
            r#"{"ociVersion":"1.0.2","root":{"path":"rootfs"}}"#,
        )
        .unwrap();
        bundle
    }

    fn args(dir: &Path, event: &str, network: &str) -> HookArgs {
        HookArgs::try_parse_from([
            "oci-hook",
            event,
            "--full-id",
            "default-abc",
            "--container-state-dir",
            dir.join("state").to_str().unwrap(),
            "--data-store",
            dir.join("data").to_str().unwrap(),
            "--namespace",
            "default",
            "--cni-netconfpath",
            dir.join("net.d").to_str().unwrap(),
            "--network",
            network,
            "--p",
            r#"{"hostPort":8080,"containerPort":80,"protocol":"tcp"}"#,
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_hook_args() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(dir.path(), "createRuntime", "bridge");
        assert_eq!(a.networks, vec!["bridge"]);
        assert_eq!(a.cni_path, "/opt/cni/bin");
        assert!(a.plugin_managed());
        let ports = a.port_mappings().unwrap();
        assert_eq!(ports[0].container_port, 80);
        assert!(a.log_path().ends_with("state/oci-hook.createRuntime.log"));
    }

    #[test]
    fn test_open_log_appends_under_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        let argv: Vec<String> = ["oci-hook", "postStop", "--full-id", "default-abc", "--container-state-dir"]
            .iter()
            .map(|s| s.to_string())
            .chain([dir.path().join("state").display().to_string()])
            .chain(["--data-store", "/tmp/x", "--namespace", "default", "--cni-netconfpath", "/tmp/n"].map(String::from))
            .collect();
        let mut f = open_log(&argv).unwrap();
        writeln!(f, "hello").unwrap();
        let log = std::fs::read_to_string(dir.path().join("state/oci-hook.postStop.log")).unwrap();
        assert_eq!(log, "hello\n");
        assert!(open_log(&["oci-hook".to_string()]).is_none());
    }

    #[test]
    fn test_rootfs_relative_to_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let b = bundle(dir.path());
        assert_eq!(rootfs_path(&b).unwrap(), b.join("rootfs"));
    }

    #[tokio::test]
    async fn test_none_network_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let state = RuntimeState {
            id: "abc".into(),
            pid: 42,
            bundle: bundle(dir.path()),
        };
        for event in ["createRuntime", "postStop"] {
            run(&args(dir.path(), event, "none"), &state).await.unwrap();
        }
        assert!(!dir.path().join("state/resolv.conf").exists());
        assert!(!dir.path().join("bundle/rootfs/etc/resolv.conf").exists());
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let dir = tempfile::tempdir().unwrap();
        let state = RuntimeState {
            id: "abc".into(),
            pid: 0,
            bundle: bundle(dir.path()),
        };
        let err = run(&args(dir.path(), "prestart", "none"), &state).await.unwrap_err();
        assert!(matches!(err, RuneError::Usage(_)));
    }

    #[tokio::test]
    async fn test_post_stop_keeps_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(dir.path(), "postStop", "missing-net");
        std::fs::create_dir_all(&a.container_state_dir).unwrap();
        std::fs::write(a.container_state_dir.join("resolv.conf"), "nameserver 1.1.1.1\n").unwrap();
        let results = DataStore::new(&a.data_store).network_results_dir("default", "abc");
        std::fs::create_dir_all(&results).unwrap();

        let state = RuntimeState {
            id: "abc".into(),
            pid: 0,
            bundle: bundle(dir.path()),
        };
        run(&a, &state).await.unwrap();
        assert!(a.container_state_dir.join("resolv.conf").exists());
        assert!(!results.exists());
    }
}
