//! Hosts store
//!
//! Each container has `etchosts/<ns>/<id>/{meta.json,hosts}`. The `hosts`
//! file is bind-mounted at `/etc/hosts` and lists every container that
//! shares at least one network with its owner.

use super::layout::DataStore;
use super::lock::with_dir_lock;
use super::atomic_write;
use crate::error::{Result, RuneError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::debug;

/// Per-container hosts record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostsMeta {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub name: Option<String>,
    /// network name -> IPv4 address, filled once the plugin chain ran
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
    /// `--add-host` entries as (host, ip)
    #[serde(default)]
    pub extra_hosts: Vec<(String, String)>,
}

pub struct HostsStore {
    dir: PathBuf,
}

impl HostsStore {
    pub fn open(store: &DataStore, namespace: &str) -> Result<Self> {
        let dir = store.hosts_dir(namespace);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of the generated hosts file for `id`
    pub fn hosts_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join("hosts")
    }

    /// Register a container and write its hosts file
    pub fn allocate(&self, meta: HostsMeta) -> Result<PathBuf> {
        with_dir_lock(&self.dir, || {
            let entry = self.dir.join(&meta.id);
            std::fs::create_dir_all(&entry)?;
            atomic_write(
                &entry.join("meta.json"),
                &serde_json::to_vec_pretty(&meta)?,
                0o644,
            )?;
            self.regenerate()?;
            Ok(self.hosts_path(&meta.id))
        })
    }

    /// Record the addresses a container got on its networks
    pub fn set_networks(&self, id: &str, networks: BTreeMap<String, String>) -> Result<()> {
        with_dir_lock(&self.dir, || {
            let mut meta = self.read(id)?;
            meta.networks = networks;
            atomic_write(
                &self.dir.join(id).join("meta.json"),
                &serde_json::to_vec_pretty(&meta)?,
                0o644,
            )?;
            self.regenerate()
        })
    }

    /// Forget a container. Missing entries are fine.
    pub fn release(&self, id: &str) -> Result<()> {
        with_dir_lock(&self.dir, || {
            match std::fs::remove_dir_all(self.dir.join(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            debug!("released hosts entry {}", id);
            self.regenerate()
        })
    }

    pub fn read(&self, id: &str) -> Result<HostsMeta> {
        let path = self.dir.join(id).join("meta.json");
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuneError::NotFound(format!("hosts entry {}", id))
            } else {
                e.into()
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn all(&self) -> Result<Vec<HostsMeta>> {
        let mut metas = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(meta) = self.read(&entry.file_name().to_string_lossy()) {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metas)
    }

    // Caller holds the lock.
    fn regenerate(&self) -> Result<()> {
        let metas = self.all()?;
        for meta in &metas {
            let content = render_hosts(meta, &metas);
            atomic_write(&self.hosts_path(&meta.id), content.as_bytes(), 0o644)?;
        }
        Ok(())
    }
}

/// Render `/etc/hosts` for `owner` given every known container
pub fn render_hosts(owner: &HostsMeta, all: &[HostsMeta]) -> String {
    let mut out = String::new();
    out.push_str("127.0.0.1\tlocalhost localhost.localdomain\n");
    out.push_str("::1\t\tlocalhost localhost.localdomain\n");

    for (host, ip) in &owner.extra_hosts {
        let _ = writeln!(out, "{}\t{}", ip, host);
    }

    for other in all {
        for (net, ip) in &other.networks {
            if !owner.networks.contains_key(net) {
                continue;
            }
            let mut names = vec![other.hostname.clone()];
            if let Some(name) = &other.name {
                if name != &other.hostname {
                    names.push(name.clone());
                }
            }
            let _ = writeln!(out, "{}\t{}", ip, names.join(" "));
        }
    }
    out
}
