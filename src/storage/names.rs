//! Container name store
//!
//! One file per name under `names/<ns>/`, holding the owning container id.

use super::layout::DataStore;
use super::lock::with_dir_lock;
use super::atomic_write;
use crate::error::{Result, RuneError};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("static regex")
    })
}

/// Reject names outside `[a-zA-Z0-9][a-zA-Z0-9_.-]*`
pub fn validate_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(RuneError::usage(format!(
            "invalid container name {:?}: must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
            name
        )))
    }
}

/// Name to id mapping of a single namespace
pub struct NameStore {
    dir: PathBuf,
    containers_dir: PathBuf,
}

impl NameStore {
    /// Open the store and drop entries whose container state is gone
    pub fn open(store: &DataStore, namespace: &str) -> Result<Self> {
        let names = Self {
            dir: store.names_dir(namespace),
            containers_dir: store.containers_dir(namespace),
        };
        std::fs::create_dir_all(&names.dir)?;
        names.reconcile()?;
        Ok(names)
    }

    fn reconcile(&self) -> Result<()> {
        with_dir_lock(&self.dir, || {
            for (name, id) in self.entries()? {
                if !self.containers_dir.join(&id).is_dir() {
                    warn!("dropping stale name {} for missing container {}", name, id);
                    let _ = std::fs::remove_file(self.dir.join(&name));
                }
            }
            Ok(())
        })
    }

    /// Bind `name` to `id`; fails when a live entry points elsewhere
    pub fn acquire(&self, name: &str, id: &str) -> Result<()> {
        validate_name(name)?;
        with_dir_lock(&self.dir, || {
            let path = self.dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(existing) if existing.trim() != id => {
                    return Err(RuneError::NameAlreadyInUse {
                        name: name.to_string(),
                        id: existing.trim().to_string(),
                    });
                }
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            atomic_write(&path, id.as_bytes(), 0o644)?;
            debug!("acquired name {} for {}", name, id);
            Ok(())
        })
    }

    /// Remove the entry iff it still points at `id`
    pub fn release(&self, name: &str, id: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        with_dir_lock(&self.dir, || {
            let path = self.dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(existing) if existing.trim() == id => {
                    std::fs::remove_file(&path)?;
                    debug!("released name {}", name);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Id bound to `name`, if any
    pub fn lookup(&self, name: &str) -> Result<Option<String>> {
        if validate_name(name).is_err() {
            return Ok(None);
        }
        match std::fs::read_to_string(self.dir.join(name)) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All (name, id) pairs
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Ok(id) = std::fs::read_to_string(entry.path()) {
                out.push((name, id.trim().to_string()));
            }
        }
        out.sort();
        Ok(out)
    }
}
