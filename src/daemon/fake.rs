//! In-memory backend for tests

use super::{
    ContainerRecord, ContainerService, ImageRecord, ImageService, LeaseManager, Mount, Scope,
    Snapshotter, TaskInfo, TaskIo, TaskService, TaskStatus,
};
use crate::error::{Result, RuneError};
use crate::image::oci::{media_types, sha256_digest, Descriptor};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct FakeTask {
    pub pid: u32,
    pub status: TaskStatus,
    pub exit_status: u32,
    pub io: TaskIo,
    /// Signals delivered to a non-paused process, in order
    pub signals: Vec<u32>,
    pending: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct FakeSnapshot {
    pub parent: String,
    pub committed: bool,
    pub view: bool,
}

#[derive(Default)]
struct State {
    images: HashMap<String, ImageRecord>,
    blobs: HashMap<String, Vec<u8>>,
    blob_labels: HashMap<String, HashMap<String, String>>,
    snapshots: HashMap<String, FakeSnapshot>,
    containers: HashMap<String, ContainerRecord>,
    tasks: HashMap<String, FakeTask>,
    execs: HashMap<(String, String), FakeTask>,
    leases: HashSet<String>,
    next_pid: u32,
    /// Exit code a started init process exits with right away
    auto_exit: Option<u32>,
    /// Whether the init process dies on SIGTERM
    ignore_sigterm: bool,
    /// Container creation fails after the request is validated
    fail_container_create: bool,
    /// The process exits just before a signal lands; kill reports NotFound
    exit_before_kill: bool,
}

/// Shared in-memory daemon. Clones observe the same state.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl FakeBackend {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Started init processes exit immediately with `code`
    pub fn set_auto_exit(&self, code: Option<u32>) {
        self.lock().auto_exit = code;
    }

    pub fn set_ignore_sigterm(&self, ignore: bool) {
        self.lock().ignore_sigterm = ignore;
    }

    pub fn set_fail_container_create(&self, fail: bool) {
        self.lock().fail_container_create = fail;
    }

    pub fn set_exit_before_kill(&self, exit: bool) {
        self.lock().exit_before_kill = exit;
    }

    pub fn active_leases(&self) -> Vec<String> {
        self.lock().leases.iter().cloned().collect()
    }

    pub fn task(&self, id: &str) -> Option<FakeTask> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn snapshot(&self, key: &str) -> Option<FakeSnapshot> {
        self.lock().snapshots.get(key).cloned()
    }

    pub fn snapshot_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().snapshots.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn blob_labels(&self, digest: &str) -> HashMap<String, String> {
        self.lock().blob_labels.get(digest).cloned().unwrap_or_default()
    }

    /// Put a blob straight into the content store
    pub fn put_blob(&self, data: &[u8]) -> String {
        let digest = sha256_digest(data);
        self.lock().blobs.insert(digest.clone(), data.to_vec());
        digest
    }

    /// Force a task into a status, as an out-of-band state change would
    pub fn set_task_status(&self, id: &str, status: TaskStatus) {
        if let Some(task) = self.lock().tasks.get_mut(id) {
            task.status = status;
        }
        self.notify.notify_waiters();
    }

    fn deliver(task: &mut FakeTask, signal: u32, ignore_sigterm: bool) {
        if task.status == TaskStatus::Paused {
            task.pending.push(signal);
            return;
        }
        task.signals.push(signal);
        let fatal = signal == 9 || (!ignore_sigterm && (signal == 15 || signal == 2));
        if fatal && task.status == TaskStatus::Running {
            task.status = TaskStatus::Stopped;
            task.exit_status = 128 + signal;
        }
    }
}

fn not_found(what: &str) -> RuneError {
    RuneError::NotFound(what.to_string())
}

#[async_trait]
impl ImageService for FakeBackend {
    async fn get(&self, _scope: &Scope, name: &str) -> Result<Option<ImageRecord>> {
        Ok(self.lock().images.get(name).cloned())
    }

    async fn list(&self, _scope: &Scope) -> Result<Vec<ImageRecord>> {
        let mut images: Vec<_> = self.lock().images.values().cloned().collect();
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    async fn create(&self, _scope: &Scope, image: ImageRecord) -> Result<ImageRecord> {
        self.lock().images.insert(image.name.clone(), image.clone());
        Ok(image)
    }

    async fn delete(&self, _scope: &Scope, name: &str) -> Result<()> {
        self.lock()
            .images
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn read_blob(&self, _scope: &Scope, digest: &str) -> Result<Vec<u8>> {
        self.lock()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| not_found(digest))
    }

    async fn write_blob(
        &self,
        scope: &Scope,
        desc: &Descriptor,
        data: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        if scope.lease().is_none() {
            return Err(RuneError::Rpc("blob written outside of a lease".into()));
        }
        let digest = sha256_digest(&data);
        if digest != desc.digest {
            return Err(RuneError::Rpc(format!("digest mismatch: {} != {}", digest, desc.digest)));
        }
        let mut state = self.lock();
        state.blobs.insert(digest.clone(), data);
        state.blob_labels.entry(digest).or_default().extend(labels);
        Ok(())
    }

    async fn apply_layer(&self, _scope: &Scope, layer: &Descriptor, _mounts: &[Mount]) -> Result<String> {
        let data = self
            .lock()
            .blobs
            .get(&layer.digest)
            .cloned()
            .ok_or_else(|| not_found(&layer.digest))?;
        if layer.media_type.ends_with("gzip") || layer.media_type == media_types::DOCKER_LAYER {
            let mut plain = Vec::new();
            flate2::read::GzDecoder::new(&data[..]).read_to_end(&mut plain)?;
            Ok(sha256_digest(&plain))
        } else {
            Ok(sha256_digest(&data))
        }
    }

    async fn blob_exists(&self, _scope: &Scope, digest: &str) -> Result<bool> {
        Ok(self.lock().blobs.contains_key(digest))
    }

    async fn label_blob(&self, _scope: &Scope, digest: &str, labels: HashMap<String, String>) -> Result<()> {
        let mut state = self.lock();
        if !state.blobs.contains_key(digest) {
            return Err(not_found(digest));
        }
        state.blob_labels.entry(digest.to_string()).or_default().extend(labels);
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for FakeBackend {
    async fn prepare(&self, _scope: &Scope, _snapshotter: &str, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let mut state = self.lock();
        if state.snapshots.contains_key(key) {
            return Err(RuneError::AlreadyExists(key.to_string()));
        }
        if !parent.is_empty() && !state.snapshots.contains_key(parent) {
            return Err(not_found(parent));
        }
        state.snapshots.insert(
            key.to_string(),
            FakeSnapshot { parent: parent.to_string(), committed: false, view: false },
        );
        Ok(vec![Mount {
            typ: "bind".to_string(),
            source: format!("/fake/snapshots/{}", key),
            target: String::new(),
            options: vec!["rbind".to_string(), "rw".to_string()],
        }])
    }

    async fn view(&self, _scope: &Scope, _snapshotter: &str, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let mut state = self.lock();
        if state.snapshots.contains_key(key) {
            return Err(RuneError::AlreadyExists(key.to_string()));
        }
        state.snapshots.insert(
            key.to_string(),
            FakeSnapshot { parent: parent.to_string(), committed: false, view: true },
        );
        Ok(vec![Mount {
            typ: "bind".to_string(),
            source: format!("/fake/snapshots/{}", key),
            target: String::new(),
            options: vec!["rbind".to_string(), "ro".to_string()],
        }])
    }

    async fn commit(&self, _scope: &Scope, _snapshotter: &str, name: &str, key: &str) -> Result<()> {
        let mut state = self.lock();
        if state.snapshots.contains_key(name) {
            return Err(RuneError::AlreadyExists(name.to_string()));
        }
        let mut snap = state.snapshots.remove(key).ok_or_else(|| not_found(key))?;
        snap.committed = true;
        state.snapshots.insert(name.to_string(), snap);
        Ok(())
    }

    async fn remove(&self, _scope: &Scope, _snapshotter: &str, key: &str) -> Result<()> {
        self.lock()
            .snapshots
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| not_found(key))
    }

    async fn mounts(&self, _scope: &Scope, _snapshotter: &str, key: &str) -> Result<Vec<Mount>> {
        if !self.lock().snapshots.contains_key(key) {
            return Err(not_found(key));
        }
        Ok(vec![Mount {
            typ: "bind".to_string(),
            source: format!("/fake/snapshots/{}", key),
            target: String::new(),
            options: vec!["rbind".to_string(), "rw".to_string()],
        }])
    }

    async fn exists(&self, _scope: &Scope, _snapshotter: &str, key: &str) -> Result<bool> {
        Ok(self.lock().snapshots.contains_key(key))
    }
}

#[async_trait]
impl ContainerService for FakeBackend {
    async fn create(&self, _scope: &Scope, container: ContainerRecord) -> Result<ContainerRecord> {
        let mut state = self.lock();
        if state.fail_container_create {
            return Err(RuneError::Rpc("container create failed".into()));
        }
        if state.containers.contains_key(&container.id) {
            return Err(RuneError::AlreadyExists(container.id.clone()));
        }
        let mut container = container;
        container.created_at = Some(chrono::Utc::now());
        state.containers.insert(container.id.clone(), container.clone());
        Ok(container)
    }

    async fn get(&self, _scope: &Scope, id: &str) -> Result<ContainerRecord> {
        self.lock().containers.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn list(&self, _scope: &Scope) -> Result<Vec<ContainerRecord>> {
        let mut all: Vec<_> = self.lock().containers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn update_labels(&self, _scope: &Scope, id: &str, labels: HashMap<String, String>) -> Result<()> {
        let mut state = self.lock();
        let container = state.containers.get_mut(id).ok_or_else(|| not_found(id))?;
        container.labels.extend(labels);
        Ok(())
    }

    async fn delete(&self, _scope: &Scope, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.tasks.contains_key(id) {
            return Err(RuneError::Rpc(format!("container {} has a live task", id)));
        }
        state.containers.remove(id).map(|_| ()).ok_or_else(|| not_found(id))
    }
}

#[async_trait]
impl TaskService for FakeBackend {
    async fn create(&self, _scope: &Scope, id: &str, _rootfs: &[Mount], io: &TaskIo) -> Result<u32> {
        let mut state = self.lock();
        if !state.containers.contains_key(id) {
            return Err(not_found(id));
        }
        if state.tasks.contains_key(id) {
            return Err(RuneError::AlreadyExists(format!("task {}", id)));
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.tasks.insert(
            id.to_string(),
            FakeTask {
                pid,
                status: TaskStatus::Created,
                exit_status: 0,
                io: io.clone(),
                signals: Vec::new(),
                pending: Vec::new(),
            },
        );
        Ok(pid)
    }

    async fn start(&self, _scope: &Scope, id: &str, exec_id: &str) -> Result<u32> {
        let pid = {
            let mut state = self.lock();
            let auto_exit = state.auto_exit;
            let task = if exec_id.is_empty() {
                state.tasks.get_mut(id)
            } else {
                state.execs.get_mut(&(id.to_string(), exec_id.to_string()))
            }
            .ok_or_else(|| not_found(id))?;
            task.status = TaskStatus::Running;
            if let Some(code) = auto_exit {
                task.status = TaskStatus::Stopped;
                task.exit_status = code;
            }
            task.pid
        };
        self.notify.notify_waiters();
        Ok(pid)
    }

    async fn get(&self, _scope: &Scope, id: &str) -> Result<TaskInfo> {
        let state = self.lock();
        let task = state.tasks.get(id).ok_or_else(|| not_found(id))?;
        Ok(TaskInfo {
            pid: task.pid,
            status: task.status,
            exit_status: (task.status == TaskStatus::Stopped).then_some(task.exit_status),
            exited_at: None,
        })
    }

    async fn wait(&self, scope: &Scope, id: &str, exec_id: &str) -> Result<u32> {
        scope
            .run(async {
                loop {
                    let notified = self.notify.notified();
                    {
                        let state = self.lock();
                        let task = if exec_id.is_empty() {
                            state.tasks.get(id)
                        } else {
                            state.execs.get(&(id.to_string(), exec_id.to_string()))
                        }
                        .ok_or_else(|| not_found(id))?;
                        if task.status == TaskStatus::Stopped {
                            return Ok(task.exit_status);
                        }
                    }
                    notified.await;
                }
            })
            .await
    }

    async fn kill(&self, _scope: &Scope, id: &str, exec_id: &str, signal: u32, _all: bool) -> Result<()> {
        {
            let mut state = self.lock();
            let ignore = state.ignore_sigterm;
            let exit_first = state.exit_before_kill;
            let task = if exec_id.is_empty() {
                state.tasks.get_mut(id)
            } else {
                state.execs.get_mut(&(id.to_string(), exec_id.to_string()))
            }
            .ok_or_else(|| not_found(id))?;
            if exit_first {
                task.status = TaskStatus::Stopped;
                drop(state);
                self.notify.notify_waiters();
                return Err(not_found(id));
            }
            Self::deliver(task, signal, ignore);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self, _scope: &Scope, id: &str) -> Result<u32> {
        let mut state = self.lock();
        let task = state.tasks.get(id).ok_or_else(|| not_found(id))?;
        if matches!(task.status, TaskStatus::Running | TaskStatus::Paused) {
            return Err(RuneError::Rpc(format!("task {} must be stopped before deletion", id)));
        }
        let exit = task.exit_status;
        state.tasks.remove(id);
        state.execs.retain(|(cid, _), _| cid != id);
        Ok(exit)
    }

    async fn pause(&self, _scope: &Scope, id: &str) -> Result<()> {
        let mut state = self.lock();
        let task = state.tasks.get_mut(id).ok_or_else(|| not_found(id))?;
        if task.status != TaskStatus::Running {
            return Err(RuneError::Rpc(format!("task {} is not running", id)));
        }
        task.status = TaskStatus::Paused;
        Ok(())
    }

    async fn resume(&self, _scope: &Scope, id: &str) -> Result<()> {
        {
            let mut state = self.lock();
            let ignore = state.ignore_sigterm;
            let task = state.tasks.get_mut(id).ok_or_else(|| not_found(id))?;
            if task.status != TaskStatus::Paused {
                return Err(RuneError::Rpc(format!("task {} is not paused", id)));
            }
            task.status = TaskStatus::Running;
            for signal in std::mem::take(&mut task.pending) {
                Self::deliver(task, signal, ignore);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn exec(&self, _scope: &Scope, id: &str, exec_id: &str, _process: serde_json::Value, io: &TaskIo) -> Result<()> {
        let mut state = self.lock();
        if !state.tasks.contains_key(id) {
            return Err(not_found(id));
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.execs.insert(
            (id.to_string(), exec_id.to_string()),
            FakeTask {
                pid,
                status: TaskStatus::Created,
                exit_status: 0,
                io: io.clone(),
                signals: Vec::new(),
                pending: Vec::new(),
            },
        );
        Ok(())
    }

    async fn resize(&self, _scope: &Scope, _id: &str, _exec_id: &str, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    async fn delete_process(&self, _scope: &Scope, id: &str, exec_id: &str) -> Result<u32> {
        self.lock()
            .execs
            .remove(&(id.to_string(), exec_id.to_string()))
            .map(|t| t.exit_status)
            .ok_or_else(|| not_found(exec_id))
    }
}

#[async_trait]
impl LeaseManager for FakeBackend {
    async fn create(&self, _scope: &Scope, _expire: Duration) -> Result<String> {
        let id = format!("lease-{}", uuid::Uuid::new_v4());
        self.lock().leases.insert(id.clone());
        Ok(id)
    }

    async fn delete(&self, _scope: &Scope, id: &str) -> Result<()> {
        if self.lock().leases.remove(id) {
            Ok(())
        } else {
            Err(not_found(id))
        }
    }
}
