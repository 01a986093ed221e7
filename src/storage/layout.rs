//! Data store layout
//!
//! ```text
//! <root>/
//!   containers/<ns>/<id>/     state directory (0700)
//!   volumes/<ns>/<name>/_data
//!   names/<ns>/<name>         -> id
//!   etchosts/<ns>/<id>/hosts
//!   networks/<ns>/<id>/       cached network plugin results
//! ```

use crate::error::Result;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Canonical paths of the engine's persisted state for one daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn containers_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("containers").join(namespace)
    }

    /// State directory of a single container
    pub fn container_dir(&self, namespace: &str, id: &str) -> PathBuf {
        self.containers_dir(namespace).join(id)
    }

    pub fn volumes_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("volumes").join(namespace)
    }

    pub fn names_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("names").join(namespace)
    }

    pub fn hosts_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("etchosts").join(namespace)
    }

    pub fn network_results_dir(&self, namespace: &str, id: &str) -> PathBuf {
        self.root.join("networks").join(namespace).join(id)
    }

    /// JSON log file of a container
    pub fn log_path(&self, namespace: &str, id: &str) -> PathBuf {
        self.container_dir(namespace, id)
            .join(format!("{}-json.log", id))
    }

    /// Create the container state directory with mode 0700
    pub fn ensure_container_dir(&self, namespace: &str, id: &str) -> Result<PathBuf> {
        let dir = self.container_dir(namespace, id);
        ensure_dir(&dir, 0o700)?;
        Ok(dir)
    }
}

/// Create a directory and its missing parents with the given mode
pub fn ensure_dir(dir: &Path, mode: u32) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_paths() {
        let store = DataStore::new("/var/lib/runectl/abcd1234");
        assert_eq!(
            store.container_dir("default", "c1"),
            PathBuf::from("/var/lib/runectl/abcd1234/containers/default/c1")
        );
        assert_eq!(
            store.log_path("default", "c1"),
            PathBuf::from("/var/lib/runectl/abcd1234/containers/default/c1/c1-json.log")
        );
        assert_eq!(
            store.hosts_dir("k8s"),
            PathBuf::from("/var/lib/runectl/abcd1234/etchosts/k8s")
        );
    }

    #[test]
    fn test_container_dir_mode() {
        let tmp = tempdir().unwrap();
        let store = DataStore::new(tmp.path());
        let dir = store.ensure_container_dir("default", "abc").unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        // idempotent
        store.ensure_container_dir("default", "abc").unwrap();
    }
}
