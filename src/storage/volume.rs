//! Volume management
//!
//! Volumes are host directories under `volumes/<ns>/<name>/_data` with a
//! sibling `volume.json`. Anonymous volumes use a generated 64-hex name.

use super::layout::DataStore;
use super::lock::with_dir_lock;
use super::{atomic_write, generate_id};
use crate::error::{Result, RuneError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const METADATA_FILE: &str = "volume.json";

/// Volume record, serialized in `docker volume inspect` shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Always `local`
    pub driver: String,
    /// Directory bind-mounted into containers
    pub mountpoint: PathBuf,
    /// Volume labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Always `local`
    pub scope: String,
    /// Size in bytes, filled only on request
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
}

impl Volume {
    fn new(name: &str, mountpoint: PathBuf, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint,
            labels,
            created_at: Utc::now(),
            scope: "local".to_string(),
            size: None,
        }
    }

    /// Total size of regular files in bytes
    pub fn disk_usage(&self) -> u64 {
        if !self.mountpoint.exists() {
            return 0;
        }

        walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

/// Anonymous volume names are 64 lowercase hex characters
pub fn is_anonymous_name(name: &str) -> bool {
    name.len() == 64 && name.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Volume names follow container name rules, so they never leave the store
pub fn validate_volume_name(name: &str) -> Result<()> {
    super::names::validate_name(name).map_err(|_| RuneError::usage(format!("invalid volume name {:?}", name)))
}

/// Volume store of one namespace
pub struct VolumeStore {
    dir: PathBuf,
}

impl VolumeStore {
    pub fn open(store: &DataStore, namespace: &str) -> Result<Self> {
        let dir = store.volumes_dir(namespace);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create a named volume.
    ///
    /// Creating an existing volume is a no-op when the labels match.
    pub fn create(&self, name: &str, labels: BTreeMap<String, String>) -> Result<Volume> {
        validate_volume_name(name)?;
        with_dir_lock(&self.dir, || self.create_locked(name, labels))
    }

    /// Create a fresh anonymous volume
    pub fn create_anonymous(&self) -> Result<Volume> {
        let name = generate_id();
        with_dir_lock(&self.dir, || self.create_locked(&name, BTreeMap::new()))
    }

    /// Return the named volume, creating it without labels if missing
    pub fn get_or_create(&self, name: &str) -> Result<Volume> {
        validate_volume_name(name)?;
        match self.get(name) {
            Ok(v) => Ok(v),
            Err(RuneError::VolumeNotFound(_)) => with_dir_lock(&self.dir, || {
                match self.read(name) {
                    Ok(v) => Ok(v),
                    Err(_) => self.create_locked(name, BTreeMap::new()),
                }
            }),
            Err(e) => Err(e),
        }
    }

    fn create_locked(&self, name: &str, labels: BTreeMap<String, String>) -> Result<Volume> {
        if let Ok(existing) = self.read(name) {
            if existing.labels == labels {
                return Ok(existing);
            }
            return Err(RuneError::VolumeExists(name.to_string()));
        }

        let vol_dir = self.volume_dir(name);
        let data = vol_dir.join("_data");
        std::fs::create_dir_all(&data)?;
        let volume = Volume::new(name, data, labels);
        atomic_write(
            &vol_dir.join(METADATA_FILE),
            &serde_json::to_vec_pretty(&volume)?,
            0o644,
        )?;
        debug!("created volume {}", name);
        Ok(volume)
    }

    fn read(&self, name: &str) -> Result<Volume> {
        let vol_dir = self.volume_dir(name);
        let bytes = match std::fs::read(vol_dir.join(METADATA_FILE)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuneError::VolumeNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut volume: Volume = serde_json::from_slice(&bytes)?;
        volume.mountpoint = vol_dir.join("_data");
        Ok(volume)
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(RuneError::VolumeNotFound(name.to_string()));
        }
        self.read(name)
    }

    /// List all volumes, optionally with sizes
    pub fn list(&self, with_size: bool) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(mut v) = self.read(&name) {
                if with_size {
                    v.size = Some(v.disk_usage());
                }
                volumes.push(v);
            }
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    /// Remove a volume. There is no in-use check.
    pub fn remove(&self, name: &str) -> Result<()> {
        with_dir_lock(&self.dir, || {
            self.get(name)?;
            std::fs::remove_dir_all(self.volume_dir(name))?;
            debug!("removed volume {}", name);
            Ok(())
        })
    }

    pub fn root(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, VolumeStore) {
        let temp = tempdir().unwrap();
        let store = VolumeStore::open(&DataStore::new(temp.path()), "default").unwrap();
        (temp, store)
    }

    #[test]
    fn test_create_volume() {
        let (_temp, store) = open();
        let volume = store.create("test-volume", BTreeMap::new()).unwrap();
        assert_eq!(volume.name, "test-volume");
        assert!(volume.mountpoint.ends_with("test-volume/_data"));
        assert!(volume.mountpoint.is_dir());
    }

    #[test]
    fn test_get_or_create_stays_inside_store() {
        let temp = tempdir().unwrap();
        let store = VolumeStore::open(&DataStore::new(temp.path()), "default").unwrap();
        // Resolves to <tempdir>/escape if joined unchecked.
        let err = store.get_or_create("a/../../../escape").unwrap_err();
        assert!(matches!(err, RuneError::Usage(_)));
        assert!(!temp.path().join("escape").exists());
        assert!(store.get_or_create("cache").unwrap().mountpoint.is_dir());
    }

    #[test]
    fn test_create_is_idempotent_only_with_same_labels() {
        let (_temp, store) = open();
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "db".to_string());
        let first = store.create("data", labels.clone()).unwrap();
        let again = store.create("data", labels).unwrap();
        assert_eq!(first.created_at, again.created_at);

        let err = store.create("data", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, RuneError::VolumeExists(_)));
    }

    #[test]
    fn test_remove_volume() {
        let (_temp, store) = open();
        let volume = store.create("test-volume", BTreeMap::new()).unwrap();
        std::fs::write(volume.mountpoint.join("f"), b"x").unwrap();
        store.remove("test-volume").unwrap();

        assert!(matches!(store.get("test-volume"), Err(RuneError::VolumeNotFound(_))));
        assert!(!volume.mountpoint.exists());
        assert!(store.remove("test-volume").unwrap_err().is_not_found());
    }

    #[test]
    fn test_anonymous_volumes() {
        let (_temp, store) = open();
        let anon = store.create_anonymous().unwrap();
        assert!(is_anonymous_name(&anon.name));
        assert!(!is_anonymous_name("data"));
        let listed: Vec<String> = store.list(false).unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(listed, vec![anon.name]);
    }

    #[test]
    fn test_list_with_size() {
        let (_temp, store) = open();
        let v = store.get_or_create("sized").unwrap();
        std::fs::write(v.mountpoint.join("a"), vec![0u8; 100]).unwrap();
        let listed = store.list(true).unwrap();
        assert_eq!(listed[0].size, Some(100));
    }
}
