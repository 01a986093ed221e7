//! Plugin chain execution
//!
//! Plugins are executables found on the plugin path. Each receives its
//! config on stdin and the operation in `CNI_*` environment variables;
//! results are chained through `prevResult`.

use super::config::NetworkConfig;
use super::ports::PortMapping;
use crate::error::{Result, RuneError};
use crate::storage::atomic_write;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A network to join, optionally at a fixed address
#[derive(Debug, Clone)]
pub struct Attachment {
    pub network: NetworkConfig,
    pub ip: Option<IpAddr>,
}

/// Outcome of joining one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachResult {
    pub network: String,
    pub interface: String,
    /// Addresses without prefix length
    pub ips: Vec<String>,
    pub result: Value,
}

#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Runs plugin chains for one container
#[derive(Debug, Clone)]
pub struct CniRunner {
    paths: Vec<PathBuf>,
    /// Where ADD results are cached for the matching DEL
    results_dir: PathBuf,
}

impl CniRunner {
    pub fn new(cni_path: &str, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: cni_path
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            results_dir: results_dir.into(),
        }
    }

    fn find_plugin(&self, typ: &str) -> Result<PathBuf> {
        self.paths
            .iter()
            .map(|dir| dir.join(typ))
            .find(|p| p.is_file())
            .ok_or_else(|| RuneError::PluginMissing {
                plugin: typ.to_string(),
                path: self
                    .paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            })
    }

    fn result_path(&self, network: &str) -> PathBuf {
        self.results_dir.join(format!("{}.json", network))
    }

    async fn exec(
        &self,
        command: &str,
        conf: &Value,
        full_id: &str,
        netns: &str,
        ifname: &str,
        args: &str,
    ) -> Result<Option<Value>> {
        let typ = conf.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        let binary = self.find_plugin(&typ)?;
        debug!("{} {} on {} ({})", command, typ, ifname, full_id);

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", full_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", ifname)
            .env("CNI_ARGS", args)
            .env(
                "CNI_PATH",
                self.paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(":"),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(conf)?).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let message = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(e) if !e.details.is_empty() => format!("{} (code {}): {}", e.msg, e.code, e.details),
                Ok(e) if !e.msg.is_empty() => format!("{} (code {})", e.msg, e.code),
                _ => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            return Err(RuneError::Plugin { plugin: typ, message });
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&output.stdout)?))
    }

    /// Plugin config as handed to one plugin of the chain
    fn plugin_conf(network: &NetworkConfig, plugin: &Value, prev: Option<&Value>, ports: &[PortMapping]) -> Value {
        let mut conf = plugin.clone();
        conf["name"] = json!(network.name);
        conf["cniVersion"] = json!(network.cni_version);
        if let Some(prev) = prev {
            conf["prevResult"] = prev.clone();
        }
        let wants_ports = plugin
            .get("capabilities")
            .and_then(|c| c.get("portMappings"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if wants_ports && !ports.is_empty() {
            conf["runtimeConfig"] = json!({"portMappings": ports});
        }
        conf
    }

    /// Join `attachments` in order; interfaces are `eth0`, `eth1`, ...
    ///
    /// Ports are published on the first network only. When a network fails,
    /// every network joined so far is left again before returning.
    pub async fn setup(
        &self,
        full_id: &str,
        netns: &str,
        attachments: &[Attachment],
        ports: &[PortMapping],
    ) -> Result<Vec<AttachResult>> {
        let mut results: Vec<AttachResult> = Vec::new();
        for (i, attachment) in attachments.iter().enumerate() {
            let ifname = format!("eth{}", i);
            let ports = if i == 0 { ports } else { &[] };
            match self.add_network(full_id, netns, &ifname, attachment, ports).await {
                Ok(r) => results.push(r),
                Err(e) => {
                    let joined: Vec<NetworkConfig> =
                        attachments[..i + 1].iter().map(|a| a.network.clone()).collect();
                    if let Err(cleanup) = self.remove(full_id, netns, &joined).await {
                        warn!("cleanup after failed network setup: {}", cleanup);
                    }
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    async fn add_network(
        &self,
        full_id: &str,
        netns: &str,
        ifname: &str,
        attachment: &Attachment,
        ports: &[PortMapping],
    ) -> Result<AttachResult> {
        let network = &attachment.network;
        let args = match attachment.ip {
            Some(ip) => format!("IgnoreUnknown=1;IP={}", ip),
            None => "IgnoreUnknown=1".to_string(),
        };
        let mut prev: Option<Value> = None;
        for plugin in &network.plugins {
            let conf = Self::plugin_conf(network, plugin, prev.as_ref(), ports);
            if let Some(result) = self.exec("ADD", &conf, full_id, netns, ifname, &args).await? {
                prev = Some(result);
            }
        }
        let result = prev.unwrap_or_else(|| json!({}));
        let ips = result
            .get("ips")
            .and_then(Value::as_array)
            .map(|ips| {
                ips.iter()
                    .filter_map(|ip| ip.get("address").and_then(Value::as_str))
                    .map(|a| a.split('/').next().unwrap_or(a).to_string())
                    .collect()
            })
            .unwrap_or_default();
        let attached = AttachResult {
            network: network.name.clone(),
            interface: ifname.to_string(),
            ips,
            result,
        };
        atomic_write(
            &self.result_path(&network.name),
            &serde_json::to_vec(&attached)?,
            0o600,
        )?;
        info!("attached {} to {} as {} ({:?})", full_id, network.name, ifname, attached.ips);
        Ok(attached)
    }

    /// Results cached by a previous `setup`
    pub fn cached_results(&self, networks: &[NetworkConfig]) -> Vec<AttachResult> {
        networks
            .iter()
            .filter_map(|n| std::fs::read(self.result_path(&n.name)).ok())
            .filter_map(|raw| serde_json::from_slice(&raw).ok())
            .collect()
    }

    /// Leave `networks` in reverse order, running each chain backwards.
    ///
    /// Every network is attempted; the first error is returned.
    pub async fn remove(&self, full_id: &str, netns: &str, networks: &[NetworkConfig]) -> Result<()> {
        let mut first_err = None;
        for (i, network) in networks.iter().enumerate().rev() {
            let cached: Option<AttachResult> = std::fs::read(self.result_path(&network.name))
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok());
            let ifname = cached
                .as_ref()
                .map(|c| c.interface.clone())
                .unwrap_or_else(|| format!("eth{}", i));
            let prev = cached.as_ref().map(|c| &c.result);
            for plugin in network.plugins.iter().rev() {
                let conf = Self::plugin_conf(network, plugin, prev, &[]);
                if let Err(e) = self.exec("DEL", &conf, full_id, netns, &ifname, "IgnoreUnknown=1").await {
                    warn!("failed to detach {} from {}: {}", full_id, network.name, e);
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = std::fs::remove_file(self.result_path(&network.name)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove cached result for {}: {}", network.name, e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `/proc/<pid>/ns/net`
pub fn netns_path(pid: u32) -> String {
    format!("/proc/{}/ns/net", pid)
}
