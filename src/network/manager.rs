//! Network manager: the network config directory as a store

use super::config::{
    bridge_name, is_pseudo, CreateNetworkOptions, NetworkConfig, DEFAULT_NETWORK, MAX_NETWORK_ID,
};
use crate::error::{Result, RuneError};
use crate::storage::{atomic_write, names::validate_name, with_dir_lock};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "runectl-";
const FILE_SUFFIX: &str = ".conflist";

/// A row of `network ls`
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSummary {
    pub name: String,
    pub id: Option<u32>,
    pub driver: String,
    pub labels: std::collections::BTreeMap<String, String>,
}

/// How a container attaches to the network
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NetworkMode {
    None,
    Host,
    /// Plugin-managed networks, in attach order
    #[default]
    Bridge,
    Networks(Vec<String>),
}

impl NetworkMode {
    /// Interpret the `--network` values given on the command line
    pub fn from_flags(values: &[String]) -> Result<Self> {
        let values: Vec<String> = values
            .iter()
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            return Ok(NetworkMode::Bridge);
        }
        for exclusive in ["host", "none"] {
            if values.iter().any(|v| v == exclusive) {
                if values.len() > 1 {
                    return Err(RuneError::usage(format!(
                        "network \"{}\" cannot be combined with other networks",
                        exclusive
                    )));
                }
                return Ok(if exclusive == "host" { NetworkMode::Host } else { NetworkMode::None });
            }
        }
        let mut seen = HashSet::new();
        for v in &values {
            if !seen.insert(v.as_str()) {
                return Err(RuneError::usage(format!("network {:?} specified more than once", v)));
            }
        }
        Ok(NetworkMode::Networks(values))
    }

    /// Network names for plugin-managed attachment
    pub fn names(&self) -> Vec<String> {
        match self {
            NetworkMode::None | NetworkMode::Host => Vec::new(),
            NetworkMode::Bridge => vec![DEFAULT_NETWORK.to_string()],
            NetworkMode::Networks(n) => n.clone(),
        }
    }

    /// Value recorded in container labels and passed to the hook
    pub fn label_value(&self) -> String {
        match self {
            NetworkMode::None => "none".to_string(),
            NetworkMode::Host => "host".to_string(),
            other => other.names().join(","),
        }
    }
}

/// Network configs stored as files in the config directory
#[derive(Debug, Clone)]
pub struct NetworkManager {
    netconf_path: PathBuf,
}

impl NetworkManager {
    /// Create a new network manager
    pub fn new(netconf_path: impl Into<PathBuf>) -> Self {
        Self {
            netconf_path: netconf_path.into(),
        }
    }

    pub fn netconf_path(&self) -> &Path {
        &self.netconf_path
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.netconf_path.join(format!("{}{}{}", FILE_PREFIX, name, FILE_SUFFIX))
    }

    /// Read every plugin-list document, sorted by modification time
    pub fn load_all(&self) -> Result<Vec<NetworkConfig>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.netconf_path) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_conf = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "conflist" || e == "conf" || e == "json")
                .unwrap_or(false);
            if !is_conf {
                continue;
            }
            let raw = std::fs::read(&path)?;
            match serde_json::from_slice::<NetworkConfig>(&raw) {
                Ok(mut config) => {
                    config.modified = entry.metadata().and_then(|m| m.modified()).ok();
                    config.file = path;
                    out.push(config);
                }
                Err(e) => debug!("skipping {}: {}", path.display(), e),
            }
        }
        out.sort_by_key(|c| c.modified);
        Ok(out)
    }

    fn find(&self, name: &str) -> Result<Option<NetworkConfig>> {
        Ok(self.load_all()?.into_iter().find(|c| c.name == name))
    }

    fn write(&self, config: &NetworkConfig) -> Result<PathBuf> {
        let path = self.file_for(&config.name);
        let data = serde_json::to_vec_pretty(config)?;
        atomic_write(&path, &data, 0o644)?;
        Ok(path)
    }

    /// Smallest id in `[1, 255]` not used by any managed network.
    ///
    /// Id 0 belongs to the default network.
    fn next_id(configs: &[NetworkConfig]) -> Result<u32> {
        let used: HashSet<u32> = configs.iter().filter_map(|c| c.id).collect();
        (1..=MAX_NETWORK_ID)
            .find(|id| !used.contains(id))
            .ok_or(RuneError::SubnetExhausted(MAX_NETWORK_ID + 1))
    }

    /// Create a network
    pub fn create(&self, opts: &CreateNetworkOptions) -> Result<NetworkConfig> {
        validate_name(&opts.name)?;
        if is_pseudo(&opts.name) {
            return Err(RuneError::NetworkExists(opts.name.clone()));
        }
        with_dir_lock(&self.netconf_path, || {
            let existing = self.load_all()?;
            if existing.iter().any(|c| c.name == opts.name) {
                return Err(RuneError::NetworkExists(opts.name.clone()));
            }
            let id = Self::next_id(&existing)?;
            let mut config = NetworkConfig::build(opts, id)?;
            config.file = self.write(&config)?;
            info!("created network {} (id {})", config.name, id);
            Ok(config)
        })
    }

    /// The default network's config, written on first use
    pub fn ensure_default(&self) -> Result<NetworkConfig> {
        if let Some(config) = self.find(DEFAULT_NETWORK)? {
            return Ok(config);
        }
        with_dir_lock(&self.netconf_path, || {
            if let Some(config) = self.find(DEFAULT_NETWORK)? {
                return Ok(config);
            }
            let mut config = NetworkConfig::build(&CreateNetworkOptions::new(DEFAULT_NETWORK), 0)?;
            config.file = self.write(&config)?;
            debug!("materialized default network at {}", config.file.display());
            Ok(config)
        })
    }

    /// Pseudo networks first, then user networks by mtime
    pub fn list(&self) -> Result<Vec<NetworkSummary>> {
        let mut out: Vec<NetworkSummary> = ["host", "none"]
            .iter()
            .map(|n| NetworkSummary {
                name: n.to_string(),
                id: None,
                driver: n.to_string(),
                labels: Default::default(),
            })
            .collect();
        let configs = self.load_all()?;
        let bridge = configs.iter().find(|c| c.name == DEFAULT_NETWORK);
        out.push(NetworkSummary {
            name: DEFAULT_NETWORK.to_string(),
            id: Some(bridge.and_then(|c| c.id).unwrap_or(0)),
            driver: "bridge".to_string(),
            labels: Default::default(),
        });
        for c in configs.iter().filter(|c| c.name != DEFAULT_NETWORK) {
            out.push(NetworkSummary {
                name: c.name.clone(),
                id: c.id,
                driver: c.driver(),
                labels: c.labels.clone(),
            });
        }
        Ok(out)
    }

    /// Config of a network that can be attached to
    pub fn get(&self, name: &str) -> Result<NetworkConfig> {
        if name == DEFAULT_NETWORK {
            return self.ensure_default();
        }
        if is_pseudo(name) {
            return Err(RuneError::usage(format!("pseudo network {:?} cannot be inspected", name)));
        }
        self.find(name)?
            .ok_or_else(|| RuneError::NetworkNotFound(name.to_string()))
    }

    /// Docker-style inspect document
    pub fn inspect(&self, name: &str) -> Result<Value> {
        let config = self.get(name)?;
        let ipam: Vec<Value> = config
            .ipam_ranges()
            .into_iter()
            .map(|(subnet, gateway)| json!({"Subnet": subnet, "Gateway": gateway}))
            .collect();
        Ok(json!({
            "Name": config.name,
            "Id": config.id.map(|i| format!("{:064x}", i)),
            "Driver": config.driver(),
            "IPAM": {"Config": ipam},
            "Labels": config.labels,
            "File": config.file,
        }))
    }

    /// Remove a network and its host bridge interface
    pub async fn remove(&self, name: &str) -> Result<()> {
        if is_pseudo(name) {
            return Err(RuneError::usage(format!("{:?} is a pre-defined network and cannot be removed", name)));
        }
        let config = with_dir_lock(&self.netconf_path, || {
            let config = self
                .find(name)?
                .ok_or_else(|| RuneError::NetworkNotFound(name.to_string()))?;
            if config.id.is_none() {
                return Err(RuneError::usage(format!(
                    "network {:?} is not managed by runectl, refusing to remove {}",
                    name,
                    config.file.display()
                )));
            }
            std::fs::remove_file(&config.file)?;
            Ok(config)
        })?;

        if let (Some(id), Some(iface)) = (config.id, config.bridge_interface()) {
            if iface == bridge_name(id) {
                remove_link(&iface).await;
            }
        }
        info!("removed network {}", name);
        Ok(())
    }

    /// Configs for `names`, in the given order
    pub fn resolve_attachment(&self, names: &[String]) -> Result<Vec<NetworkConfig>> {
        names.iter().map(|n| self.get(n)).collect()
    }
}

/// Delete a host link, ignoring a link that is already gone
async fn remove_link(iface: &str) {
    match Command::new("ip").args(["link", "delete", iface]).output().await {
        Ok(out) if out.status.success() => debug!("deleted link {}", iface),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.contains("Cannot find device") {
                warn!("failed to delete link {}: {}", iface, stderr.trim());
            }
        }
        Err(e) => warn!("failed to run ip link delete {}: {}", iface, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::NetworkDriver;

    fn manager() -> (tempfile::TempDir, NetworkManager) {
        let dir = tempfile::tempdir().unwrap();
        let m = NetworkManager::new(dir.path());
        (dir, m)
    }

    fn conf_files(dir: &Path) -> Vec<String> {
        let mut files: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".conflist"))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_create_allocates_unique_ids() {
        let (_dir, m) = manager();
        let a = m.create(&CreateNetworkOptions::new("a")).unwrap();
        let b = m.create(&CreateNetworkOptions::new("b")).unwrap();
        assert_eq!(a.id, Some(1));
        assert_eq!(b.id, Some(2));
        assert!(matches!(
            m.create(&CreateNetworkOptions::new("a")),
            Err(RuneError::NetworkExists(_))
        ));
        assert!(matches!(
            m.create(&CreateNetworkOptions::new("host")),
            Err(RuneError::NetworkExists(_))
        ));
        assert!(m.create(&CreateNetworkOptions::new("-bad")).is_err());
    }

    #[test]
    fn test_ids_exhausted() {
        let (_dir, m) = manager();
        for i in 1..=MAX_NETWORK_ID {
            let opts = CreateNetworkOptions::new(&format!("n{}", i)).subnet("192.168.0.0/24");
            m.create(&opts).unwrap();
        }
        let err = m.create(&CreateNetworkOptions::new("overflow")).unwrap_err();
        assert!(matches!(err, RuneError::SubnetExhausted(_)));
    }

    #[test]
    fn test_list_puts_pseudo_networks_first() {
        let (_dir, m) = manager();
        m.create(&CreateNetworkOptions::new("zeta")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        m.create(
            &CreateNetworkOptions::new("alpha")
                .driver(NetworkDriver::Ipvlan)
                .option("parent", "eth0"),
        )
        .unwrap();
        let names: Vec<String> = m.list().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["host", "none", "bridge", "zeta", "alpha"]);
        let drivers: Vec<String> = m.list().unwrap().into_iter().map(|n| n.driver).collect();
        assert_eq!(drivers[4], "ipvlan");
    }

    #[tokio::test]
    async fn test_create_then_remove_restores_directory() {
        let (dir, m) = manager();
        m.ensure_default().unwrap();
        let before = conf_files(dir.path());
        m.create(&CreateNetworkOptions::new("n0")).unwrap();
        assert_eq!(conf_files(dir.path()).len(), before.len() + 1);
        m.remove("n0").await.unwrap();
        assert_eq!(conf_files(dir.path()), before);
        assert!(matches!(m.remove("n0").await, Err(RuneError::NetworkNotFound(_))));
        assert!(m.remove("bridge").await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_configs_are_not_removed() {
        let (dir, m) = manager();
        std::fs::write(
            dir.path().join("10-other.conflist"),
            r#"{"cniVersion": "1.0.0", "name": "other", "plugins": [{"type": "bridge"}]}"#,
        )
        .unwrap();
        assert_eq!(m.get("other").unwrap().id, None);
        assert!(m.remove("other").await.is_err());
        assert!(dir.path().join("10-other.conflist").exists());
    }

    #[test]
    fn test_resolve_attachment_keeps_order() {
        let (_dir, m) = manager();
        m.create(&CreateNetworkOptions::new("n1")).unwrap();
        m.create(&CreateNetworkOptions::new("n0")).unwrap();
        let names = vec!["n0".to_string(), "bridge".to_string(), "n1".to_string()];
        let resolved: Vec<String> = m.resolve_attachment(&names).unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(resolved, names);
        let default = m.get("bridge").unwrap();
        assert_eq!(default.id, Some(0));
        assert_eq!(default.bridge_interface().as_deref(), Some("runectl0"));
        assert!(matches!(
            m.resolve_attachment(&["missing".to_string()]),
            Err(RuneError::NetworkNotFound(_))
        ));
    }

    #[test]
    fn test_network_mode_from_flags() {
        assert_eq!(NetworkMode::from_flags(&[]).unwrap(), NetworkMode::Bridge);
        assert_eq!(NetworkMode::from_flags(&["host".into()]).unwrap(), NetworkMode::Host);
        assert_eq!(
            NetworkMode::from_flags(&["a,b".into(), "c".into()]).unwrap(),
            NetworkMode::Networks(vec!["a".into(), "b".into(), "c".into()])
        );
        assert!(NetworkMode::from_flags(&["none".into(), "a".into()]).is_err());
        assert!(NetworkMode::from_flags(&["a".into(), "a".into()]).is_err());
        assert_eq!(NetworkMode::Bridge.label_value(), "bridge");
    }
}
