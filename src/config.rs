//! Global configuration

use crate::storage::DataStore;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

pub const DEFAULT_ADDRESS: &str = "/run/containerd/containerd.sock";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";
pub const DEFAULT_CNI_PATH: &str = "/opt/cni/bin";
pub const DEFAULT_CNI_NETCONFPATH: &str = "/etc/cni/net.d";
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/runectl";

/// Immutable configuration assembled from the top-level flags and their
/// environment fallbacks. Passed explicitly to every command handler.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// containerd socket address
    pub address: String,
    /// containerd namespace
    pub namespace: String,
    /// Snapshotter used for unpack and rootfs
    pub snapshotter: String,
    /// Directories searched for CNI plugin binaries
    pub cni_path: String,
    /// Directory holding network configuration lists
    pub cni_netconfpath: PathBuf,
    /// Root of the persisted state
    pub data_root: PathBuf,
    /// Allow plain HTTP fallback for registries
    pub insecure_registry: bool,
    pub debug: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            cni_path: DEFAULT_CNI_PATH.to_string(),
            cni_netconfpath: PathBuf::from(DEFAULT_CNI_NETCONFPATH),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            insecure_registry: false,
            debug: false,
        }
    }
}

impl GlobalConfig {
    /// Socket path with any `unix://` scheme removed
    pub fn socket_path(&self) -> &str {
        self.address
            .strip_prefix("unix://")
            .unwrap_or(&self.address)
    }

    /// The data store for the configured daemon.
    ///
    /// Each daemon address gets its own subdirectory so engines talking to
    /// different daemons never share names or volumes.
    pub fn data_store(&self) -> DataStore {
        DataStore::new(self.data_root.join(address_hash(self.socket_path())))
    }
}

/// First 8 hex characters of sha256(address)
pub fn address_hash(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}
