//! Internal container labels
//!
//! Everything the engine needs to find again after `create` is written as a
//! container label (and mirrored into the OCI annotations).

use super::mounts::MountPoint;
use crate::error::Result;
use crate::network::PortMapping;
use std::collections::HashMap;

pub const PREFIX: &str = "runectl/";
pub const NAMESPACE: &str = "runectl/namespace";
pub const NAME: &str = "runectl/name";
pub const HOSTNAME: &str = "runectl/hostname";
pub const STATE_DIR: &str = "runectl/state-dir";
pub const NETWORKS: &str = "runectl/networks";
pub const PORTS: &str = "runectl/ports";
pub const LOG_URI: &str = "runectl/log-uri";
pub const ANONYMOUS_VOLUMES: &str = "runectl/anonymous-volumes";
pub const PID_FILE: &str = "runectl/pid-file";
pub const PLATFORM: &str = "runectl/platform";
pub const MOUNTS: &str = "runectl/mounts";
pub const EXTRA_HOSTS: &str = "runectl/extra-hosts";
pub const STOP_SIGNAL: &str = "runectl/stop-signal";
pub const STOP_TIMEOUT: &str = "runectl/stop-timeout";
pub const IMAGE_REF: &str = "runectl/image";
pub const AUTO_REMOVE: &str = "runectl/auto-remove";

// Read by the daemon's restart monitor.
pub const RESTART_STATUS: &str = "containerd.io/restart.status";
pub const RESTART_POLICY: &str = "containerd.io/restart.policy";
pub const RESTART_LOG_URI: &str = "containerd.io/restart.loguri";
pub const RESTART_EXPLICITLY_STOPPED: &str = "containerd.io/restart.explicitly-stopped";

/// Typed view of the internal labels of one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InternalLabels {
    pub namespace: String,
    pub name: Option<String>,
    pub hostname: String,
    pub state_dir: String,
    /// `none`, `host`, or network names in attach order
    pub networks: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub log_uri: Option<String>,
    pub anonymous_volumes: Vec<String>,
    pub pid_file: Option<String>,
    pub platform: String,
    pub mounts: Vec<MountPoint>,
    pub extra_hosts: Vec<String>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u32>,
    pub image: String,
    /// `--rm` on a detached container: removed once stopped
    pub auto_remove: bool,
}

impl InternalLabels {
    pub fn to_labels(&self) -> Result<HashMap<String, String>> {
        let mut labels = HashMap::new();
        labels.insert(NAMESPACE.to_string(), self.namespace.clone());
        labels.insert(HOSTNAME.to_string(), self.hostname.clone());
        labels.insert(STATE_DIR.to_string(), self.state_dir.clone());
        labels.insert(NETWORKS.to_string(), serde_json::to_string(&self.networks)?);
        labels.insert(PLATFORM.to_string(), self.platform.clone());
        labels.insert(IMAGE_REF.to_string(), self.image.clone());
        if let Some(name) = &self.name {
            labels.insert(NAME.to_string(), name.clone());
        }
        if !self.ports.is_empty() {
            labels.insert(PORTS.to_string(), serde_json::to_string(&self.ports)?);
        }
        if let Some(uri) = &self.log_uri {
            labels.insert(LOG_URI.to_string(), uri.clone());
        }
        if !self.anonymous_volumes.is_empty() {
            labels.insert(ANONYMOUS_VOLUMES.to_string(), serde_json::to_string(&self.anonymous_volumes)?);
        }
        if let Some(pid_file) = &self.pid_file {
            labels.insert(PID_FILE.to_string(), pid_file.clone());
        }
        if !self.mounts.is_empty() {
            labels.insert(MOUNTS.to_string(), serde_json::to_string(&self.mounts)?);
        }
        if !self.extra_hosts.is_empty() {
            labels.insert(EXTRA_HOSTS.to_string(), serde_json::to_string(&self.extra_hosts)?);
        }
        if let Some(sig) = &self.stop_signal {
            labels.insert(STOP_SIGNAL.to_string(), sig.clone());
        }
        if self.auto_remove {
            labels.insert(AUTO_REMOVE.to_string(), "true".to_string());
        }
        if let Some(t) = self.stop_timeout {
            labels.insert(STOP_TIMEOUT.to_string(), t.to_string());
        }
        Ok(labels)
    }

    /// Parse labels back. Malformed JSON values read as empty.
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        fn json<T: serde::de::DeserializeOwned + Default>(labels: &HashMap<String, String>, key: &str) -> T {
            labels
                .get(key)
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default()
        }
        let get = |key: &str| labels.get(key).cloned();

        Self {
            namespace: get(NAMESPACE).unwrap_or_default(),
            name: get(NAME).filter(|n| !n.is_empty()),
            hostname: get(HOSTNAME).unwrap_or_default(),
            state_dir: get(STATE_DIR).unwrap_or_default(),
            networks: json(labels, NETWORKS),
            ports: json(labels, PORTS),
            log_uri: get(LOG_URI),
            anonymous_volumes: json(labels, ANONYMOUS_VOLUMES),
            pid_file: get(PID_FILE),
            platform: get(PLATFORM).unwrap_or_default(),
            mounts: json(labels, MOUNTS),
            extra_hosts: json(labels, EXTRA_HOSTS),
            stop_signal: get(STOP_SIGNAL),
            stop_timeout: get(STOP_TIMEOUT).and_then(|t| t.parse().ok()),
            image: get(IMAGE_REF).unwrap_or_default(),
            auto_remove: get(AUTO_REMOVE).as_deref() == Some("true"),
        }
    }
}

/// User-visible labels: everything outside the engine's own keys
pub fn user_labels(labels: &HashMap<String, String>) -> HashMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| !k.starts_with(PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_labels_survive_storage() {
        let internal = InternalLabels {
            namespace: "default".into(),
            name: Some("web".into()),
            hostname: "abcdef012345".into(),
            state_dir: "/var/lib/runectl/x/containers/default/abc".into(),
            networks: vec!["n0".into(), "n1".into()],
            ports: crate::network::ports::parse_publish("127.0.0.1:8080:80").unwrap(),
            anonymous_volumes: vec!["f".repeat(64)],
            stop_timeout: Some(3),
            ..Default::default()
        };
        let labels = internal.to_labels().unwrap();
        assert_eq!(labels[NAME], "web");
        assert!(!labels.contains_key(LOG_URI));
        assert_eq!(InternalLabels::from_labels(&labels), internal);
    }

    #[test]
    fn test_user_labels_hide_internal_keys() {
        let mut labels = HashMap::new();
        labels.insert(NAME.to_string(), "web".to_string());
        labels.insert("tier".to_string(), "frontend".to_string());
        labels.insert(RESTART_STATUS.to_string(), "running".to_string());
        let user = user_labels(&labels);
        assert_eq!(user.len(), 2);
        assert!(user.contains_key("tier"));
    }

    #[test]
    fn test_malformed_values_read_as_empty() {
        let mut labels = HashMap::new();
        labels.insert(NETWORKS.to_string(), "not json".to_string());
        let internal = InternalLabels::from_labels(&labels);
        assert!(internal.networks.is_empty());
        assert!(internal.name.is_none());
    }
}
