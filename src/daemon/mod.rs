//! containerd client facade
//!
//! The engine talks to the daemon only through the capability traits in
//! this module. [`containerd::ContainerdBackend`] implements them over gRPC;
//! tests use the in-memory `fake` backend.

pub mod containerd;
#[cfg(test)]
pub mod fake;

use crate::error::{Result, RuneError};
use crate::image::oci::Descriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default OCI runtime shim
pub const RUNC_RUNTIME: &str = "io.containerd.runc.v2";

/// Request scope: namespace, optional lease and cancellation.
///
/// Cloning is cheap; clones share the cancellation token.
#[derive(Debug, Clone)]
pub struct Scope {
    namespace: String,
    lease: Option<String>,
    cancel: CancellationToken,
}

impl Scope {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            lease: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn lease(&self) -> Option<&str> {
        self.lease.as_deref()
    }

    /// Same scope, with every request attached to `lease`
    pub fn with_lease(&self, lease: &str) -> Self {
        Self {
            lease: Some(lease.to_string()),
            ..self.clone()
        }
    }

    /// Cancel every in-flight and future request. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Race `fut` against cancellation, checking before and after.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_canceled() {
            return Err(RuneError::Canceled);
        }
        let out = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RuneError::Canceled),
            out = fut => out,
        };
        if self.is_canceled() {
            return Err(RuneError::Canceled);
        }
        out
    }
}

/// Filesystem mount as returned by a snapshotter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mount {
    pub typ: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

/// Image record in the daemon's image store
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// Canonical reference, e.g. `docker.io/library/alpine:latest`
    pub name: String,
    pub target: Descriptor,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    pub fn new(name: &str, target: Descriptor) -> Self {
        Self {
            name: name.to_string(),
            target,
            labels: HashMap::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Container record in the daemon's metadata store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub runtime: String,
    /// OCI runtime spec as JSON
    pub spec: Option<serde_json::Value>,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Task status as reported by the shim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Unknown => write!(f, "unknown"),
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Stopped => write!(f, "stopped"),
            TaskStatus::Paused => write!(f, "paused"),
            TaskStatus::Pausing => write!(f, "pausing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: u32,
    pub status: TaskStatus,
    pub exit_status: Option<u32>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// Stdio wiring handed to the shim: FIFO paths or a logging URI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIo {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

#[async_trait]
pub trait ImageService: Send + Sync {
    /// Look up an image record by canonical name
    async fn get(&self, scope: &Scope, name: &str) -> Result<Option<ImageRecord>>;
    async fn list(&self, scope: &Scope) -> Result<Vec<ImageRecord>>;
    /// Create the record, or update it when the name exists
    async fn create(&self, scope: &Scope, image: ImageRecord) -> Result<ImageRecord>;
    async fn delete(&self, scope: &Scope, name: &str) -> Result<()>;
    async fn read_blob(&self, scope: &Scope, digest: &str) -> Result<Vec<u8>>;
    /// Ingest a blob. Blobs that already exist are accepted silently.
    async fn write_blob(
        &self,
        scope: &Scope,
        desc: &Descriptor,
        data: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<()>;
    /// Apply a compressed or plain layer onto mounts, returning the diff id
    async fn apply_layer(&self, scope: &Scope, layer: &Descriptor, mounts: &[Mount]) -> Result<String>;
    async fn blob_exists(&self, scope: &Scope, digest: &str) -> Result<bool>;
    /// Attach labels to an existing blob
    async fn label_blob(&self, scope: &Scope, digest: &str, labels: HashMap<String, String>) -> Result<()>;
}

#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn prepare(&self, scope: &Scope, snapshotter: &str, key: &str, parent: &str) -> Result<Vec<Mount>>;
    async fn view(&self, scope: &Scope, snapshotter: &str, key: &str, parent: &str) -> Result<Vec<Mount>>;
    async fn commit(&self, scope: &Scope, snapshotter: &str, name: &str, key: &str) -> Result<()>;
    async fn remove(&self, scope: &Scope, snapshotter: &str, key: &str) -> Result<()>;
    async fn mounts(&self, scope: &Scope, snapshotter: &str, key: &str) -> Result<Vec<Mount>>;
    async fn exists(&self, scope: &Scope, snapshotter: &str, key: &str) -> Result<bool>;
}

#[async_trait]
pub trait ContainerService: Send + Sync {
    async fn create(&self, scope: &Scope, container: ContainerRecord) -> Result<ContainerRecord>;
    /// `NotFound` when the container does not exist
    async fn get(&self, scope: &Scope, id: &str) -> Result<ContainerRecord>;
    async fn list(&self, scope: &Scope) -> Result<Vec<ContainerRecord>>;
    async fn update_labels(&self, scope: &Scope, id: &str, labels: HashMap<String, String>) -> Result<()>;
    async fn delete(&self, scope: &Scope, id: &str) -> Result<()>;
}

#[async_trait]
pub trait TaskService: Send + Sync {
    /// Create the init task; returns its pid
    async fn create(&self, scope: &Scope, id: &str, rootfs: &[Mount], io: &TaskIo) -> Result<u32>;
    async fn start(&self, scope: &Scope, id: &str, exec_id: &str) -> Result<u32>;
    /// `NotFound` when there is no task
    async fn get(&self, scope: &Scope, id: &str) -> Result<TaskInfo>;
    /// Block until the process exits; returns its exit status
    async fn wait(&self, scope: &Scope, id: &str, exec_id: &str) -> Result<u32>;
    async fn kill(&self, scope: &Scope, id: &str, exec_id: &str, signal: u32, all: bool) -> Result<()>;
    /// Delete the init task; returns its exit status
    async fn delete(&self, scope: &Scope, id: &str) -> Result<u32>;
    async fn pause(&self, scope: &Scope, id: &str) -> Result<()>;
    async fn resume(&self, scope: &Scope, id: &str) -> Result<()>;
    /// Register an additional process described by an OCI process spec
    async fn exec(&self, scope: &Scope, id: &str, exec_id: &str, process: serde_json::Value, io: &TaskIo) -> Result<()>;
    async fn resize(&self, scope: &Scope, id: &str, exec_id: &str, width: u32, height: u32) -> Result<()>;
    async fn delete_process(&self, scope: &Scope, id: &str, exec_id: &str) -> Result<u32>;
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    async fn create(&self, scope: &Scope, expire: Duration) -> Result<String>;
    async fn delete(&self, scope: &Scope, id: &str) -> Result<()>;
}

/// Handle bundling the capability services of one backend
#[derive(Clone)]
pub struct Client {
    pub images: Arc<dyn ImageService>,
    pub snapshots: Arc<dyn Snapshotter>,
    pub containers: Arc<dyn ContainerService>,
    pub tasks: Arc<dyn TaskService>,
    pub leases: Arc<dyn LeaseManager>,
}

impl Client {
    /// Build a client whose services are all served by `backend`
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: ImageService + Snapshotter + ContainerService + TaskService + LeaseManager + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            images: backend.clone(),
            snapshots: backend.clone(),
            containers: backend.clone(),
            tasks: backend.clone(),
            leases: backend,
        }
    }

    /// Run `f` under a fresh lease that is deleted on every exit path
    pub async fn with_lease<T, F, Fut>(&self, scope: &Scope, f: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.leases.create(scope, Duration::from_secs(24 * 3600)).await?;
        debug!("acquired lease {}", lease);
        let out = f(scope.with_lease(&lease)).await;
        // The lease must go even when the scope was canceled.
        let cleanup = Scope::new(scope.namespace());
        if let Err(e) = self.leases.delete(&cleanup, &lease).await {
            warn!("failed to release lease {}: {}", lease, e);
        }
        out
    }
}

/// Connect to the daemon and bind `namespace`.
///
/// Returns the client and a request scope; `Scope::cancel` is the
/// idempotent cancel handle.
pub async fn connect(address: &str, namespace: &str) -> Result<(Client, Scope)> {
    let path = address.strip_prefix("unix://").unwrap_or(address);
    if address.contains("://") && !address.starts_with("unix://") {
        return Err(RuneError::UnreachableDaemon {
            address: address.to_string(),
            reason: "only unix socket addresses are supported".to_string(),
        });
    }
    check_socket(path)?;
    let backend = containerd::ContainerdBackend::connect(path).await?;
    Ok((Client::from_backend(backend), Scope::new(namespace)))
}

fn check_socket(path: &str) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let unreachable = |reason: String| RuneError::UnreachableDaemon {
        address: path.to_string(),
        reason,
    };
    let meta = std::fs::metadata(path).map_err(|e| unreachable(e.to_string()))?;
    if !meta.file_type().is_socket() {
        return Err(unreachable("not a socket".to_string()));
    }
    let c_path = std::ffi::CString::new(path).map_err(|e| unreachable(e.to_string()))?;
    let rc = unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) };
    if rc != 0 {
        return Err(unreachable(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}
