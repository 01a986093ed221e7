//! Container lifecycle management
//!
//! [`ContainerManager`] drives create, start, stop and removal against the
//! daemon. Everything the engine knows about a container beyond the daemon
//! record lives in its labels and its state directory.

use super::io::{console_size, forward_signals, wants_raw_mode, Attached, FifoSet, RawModeGuard};
use super::labels::{self, InternalLabels};
use super::mounts::{copy_up, materialize, plan, with_image_view};
use super::options::{parse_signal, CreateOptions, LogConfig, LogDriver, RestartPolicy};
use super::spec::{compose, find_init_binary, HookContext, SpecInput};
use super::user::{ResolvedUser, UserDb};
use crate::config::GlobalConfig;
use crate::daemon::{Client, ContainerRecord, Mount, Scope, TaskInfo, TaskIo, TaskStatus, RUNC_RUNTIME};
use crate::error::{ignore_not_found, Result, RuneError};
use crate::image::verify::verifier;
use crate::image::{ensure_image, EnsureOptions, EnsuredImage, Fetcher, ImageStore, Platform};
use crate::logging::{self, JsonFileWriter};
use crate::network::{resolvconf, NetworkManager, NetworkMode};
use crate::runtime::Mounter;
use crate::storage::{atomic_write, generate_id, DataStore, HostsMeta, HostsStore, NameStore, VolumeStore};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds `stop` waits before SIGKILL when nothing else is configured
pub const DEFAULT_STOP_TIMEOUT: u32 = 10;

/// How often `wait` looks for the task of a container nobody started yet
const WAIT_POLL: Duration = Duration::from_millis(200);

/// A container record with its parsed labels and current task
#[derive(Debug, Clone)]
pub struct ContainerView {
    pub record: ContainerRecord,
    pub labels: InternalLabels,
    /// `None` when no task exists
    pub task: Option<TaskInfo>,
}

impl ContainerView {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        self.labels.name.as_deref().unwrap_or("")
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.task.as_ref().map(|t| t.status),
            Some(TaskStatus::Running | TaskStatus::Paused | TaskStatus::Pausing)
        )
    }
}

/// `rm` flags
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub force: bool,
    /// Also remove the anonymous volumes
    pub volumes: bool,
}

/// Resources to release when a create fails half-way
#[derive(Default)]
struct Rollback {
    id: String,
    name: Option<String>,
    state_dir: Option<PathBuf>,
    hosts: bool,
    volumes: Vec<String>,
    snapshot: Option<String>,
    cidfile: Option<PathBuf>,
}

/// Drives the container lifecycle for one namespace
pub struct ContainerManager {
    pub(super) client: Client,
    pub(super) scope: Scope,
    pub(super) config: GlobalConfig,
    pub(super) data: DataStore,
    pub(super) mounter: Arc<dyn Mounter>,
    fetcher: Arc<dyn Fetcher>,
    /// Engine executable, re-entered for hooks and logging
    exe: PathBuf,
}

impl ContainerManager {
    pub fn new(
        client: Client,
        scope: Scope,
        config: GlobalConfig,
        mounter: Arc<dyn Mounter>,
        fetcher: Arc<dyn Fetcher>,
        exe: PathBuf,
    ) -> Self {
        let data = config.data_store();
        Self {
            client,
            scope,
            config,
            data,
            mounter,
            fetcher,
            exe,
        }
    }

    pub fn namespace(&self) -> &str {
        self.scope.namespace()
    }

    pub fn data_store(&self) -> &DataStore {
        &self.data
    }

    /// Create a container; nothing is started
    pub async fn create(&self, opts: &CreateOptions) -> Result<ContainerRecord> {
        opts.validate()?;
        let mut opts = opts.clone();
        if opts.rootfs {
            let root = std::fs::canonicalize(&opts.image)
                .map_err(|e| RuneError::usage(format!("invalid rootfs {:?}: {}", opts.image, e)))?;
            opts.image = root.to_string_lossy().into_owned();
        }

        let id = generate_id();
        let mut rollback = Rollback {
            id: id.clone(),
            ..Default::default()
        };

        match self.create_inner(&id, &opts, &mut rollback).await {
            Ok(record) => {
                info!("created container {}", id);
                Ok(record)
            }
            Err(e) => {
                self.roll_back(rollback).await;
                Err(e)
            }
        }
    }

    async fn create_inner(&self, id: &str, opts: &CreateOptions, rollback: &mut Rollback) -> Result<ContainerRecord> {
        let ns = self.namespace().to_string();

        if let Some(cidfile) = &opts.cidfile {
            if cidfile.exists() {
                return Err(RuneError::usage(format!(
                    "container ID file found, make sure the other container isn't running or delete {}",
                    cidfile.display()
                )));
            }
            atomic_write(cidfile, id.as_bytes(), 0o644)?;
            rollback.cidfile = Some(cidfile.clone());
        }

        // Networks must exist before anything is allocated for them.
        if matches!(opts.network, NetworkMode::Bridge | NetworkMode::Networks(_)) {
            let networks = NetworkManager::new(&self.config.cni_netconfpath);
            if opts.network == NetworkMode::Bridge {
                networks.ensure_default()?;
            }
            networks.resolve_attachment(&opts.network.names())?;
        }

        let platform = match &opts.platform {
            Some(p) => Platform::parse(p).ok_or_else(|| RuneError::usage(format!("invalid platform {:?}", p)))?,
            None => Platform::host(),
        };
        let ensured = if opts.rootfs {
            None
        } else {
            Some(self.ensure(opts, &platform).await?)
        };
        let image_config = ensured.as_ref().map(|e| e.config().config.clone());

        let state_dir = self.data.ensure_container_dir(&ns, id)?;
        rollback.state_dir = Some(state_dir.clone());

        let name = match &opts.name {
            Some(n) => n.clone(),
            None => default_name(&opts.image, id),
        };
        NameStore::open(&self.data, &ns)?.acquire(&name, id)?;
        rollback.name = Some(name.clone());

        // Mounts, then the image view for copy-up and user lookup
        let image_volumes = image_config.as_ref().map(|c| c.volume_paths()).unwrap_or_default();
        let requests = plan(&opts.volumes, &opts.mounts, &opts.tmpfs, &image_volumes)?;
        let volumes = VolumeStore::open(&self.data, &ns)?;
        let resolved = materialize(&requests, &volumes)?;
        rollback.volumes = resolved.anonymous_volumes.clone();

        let user_spec = opts
            .user
            .clone()
            .or_else(|| image_config.as_ref().and_then(|c| c.user.clone()))
            .filter(|u| !u.is_empty());
        let user = match &ensured {
            Some(img) if !resolved.copy_ups.is_empty() || user_spec.is_some() || !opts.group_add.is_empty() => {
                let copy_ups = resolved.copy_ups.clone();
                let group_add = opts.group_add.clone();
                let user_spec = user_spec.clone();
                with_image_view(
                    &self.client,
                    &self.scope,
                    &img.snapshotter,
                    &img.chain_id,
                    self.mounter.clone(),
                    move |root, stop| {
                        for c in &copy_ups {
                            copy_up(root, &c.destination, &c.volume_dir, stop)?;
                        }
                        resolve_user(root, user_spec.as_deref(), &group_add)
                    },
                )
                .await?
            }
            Some(_) => ResolvedUser::default(),
            None => resolve_user(Path::new(&opts.image), user_spec.as_deref(), &opts.group_add)?,
        };

        // Generated files
        let hostname = match (&opts.hostname, &opts.network) {
            (Some(h), _) => h.clone(),
            (None, NetworkMode::Host) => gethostname::gethostname().to_string_lossy().into_owned(),
            (None, _) => id[..12].to_string(),
        };
        let mut hosts_file = None;
        let mut hostname_file = None;
        if opts.network != NetworkMode::Host {
            let path = state_dir.join("hostname");
            atomic_write(&path, format!("{}\n", hostname).as_bytes(), 0o644)?;
            hostname_file = Some(path);
        }
        if matches!(opts.network, NetworkMode::Bridge | NetworkMode::Networks(_)) {
            resolvconf::write(&state_dir, &opts.dns)?;
            let hosts = HostsStore::open(&self.data, &ns)?;
            rollback.hosts = true;
            hosts_file = Some(hosts.allocate(HostsMeta {
                id: id.to_string(),
                hostname: hostname.clone(),
                name: Some(name.clone()),
                networks: Default::default(),
                extra_hosts: opts.add_hosts.clone(),
            })?);
        }

        let init_binary = if opts.init {
            Some(find_init_binary(opts.init_binary.as_deref())?)
        } else {
            None
        };

        // Labels
        let log_uri = (opts.log.driver == LogDriver::JsonFile).then(|| logging::log_uri(&self.exe, self.data.root()));
        let internal = InternalLabels {
            namespace: ns.clone(),
            name: Some(name.clone()),
            hostname: hostname.clone(),
            state_dir: state_dir.to_string_lossy().into_owned(),
            networks: match &opts.network {
                NetworkMode::None | NetworkMode::Host => vec![opts.network.label_value()],
                other => other.names(),
            },
            ports: opts.publish.clone(),
            log_uri: log_uri.clone(),
            anonymous_volumes: resolved.anonymous_volumes.clone(),
            pid_file: opts.pidfile.as_ref().map(|p| p.to_string_lossy().into_owned()),
            platform: platform.to_string(),
            mounts: resolved.points.clone(),
            extra_hosts: opts.add_hosts.iter().map(|(h, ip)| format!("{}:{}", h, ip)).collect(),
            stop_signal: opts
                .stop_signal
                .clone()
                .or_else(|| image_config.as_ref().and_then(|c| c.stop_signal.clone())),
            stop_timeout: opts.stop_timeout,
            image: ensured
                .as_ref()
                .map(|e| e.reference.to_string())
                .unwrap_or_else(|| opts.image.clone()),
            auto_remove: opts.rm && opts.detach,
        };
        let mut all_labels: HashMap<String, String> = opts.collect_labels()?.into_iter().collect();
        all_labels.extend(internal.to_labels()?);
        if opts.restart != RestartPolicy::No {
            all_labels.insert(labels::RESTART_POLICY.to_string(), opts.restart.to_string());
            if let Some(uri) = &log_uri {
                all_labels.insert(labels::RESTART_LOG_URI.to_string(), uri.clone());
            }
        }

        let hook = HookContext {
            exe: self.exe.clone(),
            data_root: self.data.root().to_path_buf(),
            cni_path: self.config.cni_path.clone(),
            cni_netconfpath: self.config.cni_netconfpath.to_string_lossy().into_owned(),
        };
        let spec = compose(&SpecInput {
            id,
            namespace: &ns,
            opts,
            image: image_config.as_ref(),
            state_dir: &state_dir,
            mounts: &resolved,
            user: &user,
            hostname: &hostname,
            hosts_file,
            hostname_file,
            init_binary,
            hook: &hook,
            labels: &all_labels,
        })?;

        let (snapshotter, snapshot_key) = match &ensured {
            Some(img) => {
                self.client
                    .snapshots
                    .prepare(&self.scope, &img.snapshotter, id, &img.chain_id)
                    .await?;
                rollback.snapshot = Some(img.snapshotter.clone());
                (img.snapshotter.clone(), id.to_string())
            }
            None => (String::new(), String::new()),
        };

        // The daemon record must be the last fallible step.
        atomic_write(
            &state_dir.join(LogConfig::FILE_NAME),
            &serde_json::to_vec(&opts.log)?,
            0o644,
        )?;
        let record = self
            .client
            .containers
            .create(
                &self.scope,
                ContainerRecord {
                    id: id.to_string(),
                    image: internal.image.clone(),
                    labels: all_labels,
                    runtime: opts.runtime.clone().unwrap_or_else(|| RUNC_RUNTIME.to_string()),
                    spec: Some(serde_json::to_value(&spec)?),
                    snapshotter,
                    snapshot_key,
                    created_at: None,
                },
            )
            .await?;
        Ok(record)
    }

    async fn ensure(&self, opts: &CreateOptions, platform: &Platform) -> Result<EnsuredImage> {
        let store = ImageStore::new(self.client.clone(), &self.config.snapshotter);
        let verify = verifier(opts.verify, opts.cosign_key.clone());
        ensure_image(
            &store,
            &self.scope,
            &opts.image,
            &EnsureOptions {
                policy: opts.pull,
                platform: platform.clone(),
                fetcher: self.fetcher.as_ref(),
                verifier: verify.as_deref(),
            },
        )
        .await
    }

    async fn roll_back(&self, rb: Rollback) {
        let ns = self.namespace().to_string();
        let cleanup = Scope::new(&ns);
        if let Some(snapshotter) = &rb.snapshot {
            if let Err(e) = ignore_not_found(self.client.snapshots.remove(&cleanup, snapshotter, &rb.id).await) {
                warn!("failed to remove snapshot {}: {}", rb.id, e);
            }
        }
        if rb.hosts {
            if let Err(e) = HostsStore::open(&self.data, &ns).and_then(|h| h.release(&rb.id)) {
                warn!("failed to release hosts entry of {}: {}", rb.id, e);
            }
        }
        if let Some(name) = &rb.name {
            if let Err(e) = NameStore::open(&self.data, &ns).and_then(|s| s.release(name, &rb.id)) {
                warn!("failed to release name {}: {}", name, e);
            }
        }
        if !rb.volumes.is_empty() {
            if let Ok(store) = VolumeStore::open(&self.data, &ns) {
                for v in &rb.volumes {
                    if let Err(e) = ignore_not_found(store.remove(v)) {
                        warn!("failed to remove volume {}: {}", v, e);
                    }
                }
            }
        }
        if let Some(dir) = &rb.state_dir {
            if let Err(e) = ignore_not_found(std::fs::remove_dir_all(dir).map_err(RuneError::from)) {
                warn!("failed to remove {}: {}", dir.display(), e);
            }
        }
        if let Some(cidfile) = &rb.cidfile {
            let _ = std::fs::remove_file(cidfile);
        }
    }

    /// Resolve an exact id, a unique id prefix, or a name
    pub async fn lookup(&self, target: &str) -> Result<ContainerRecord> {
        match self.client.containers.get(&self.scope, target).await {
            Ok(record) => return Ok(record),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let all = self.client.containers.list(&self.scope).await?;
        let by_prefix: Vec<&ContainerRecord> = all.iter().filter(|c| c.id.starts_with(target)).collect();
        match by_prefix.len() {
            1 => return Ok(by_prefix[0].clone()),
            n if n > 1 => return Err(RuneError::AmbiguousId(target.to_string())),
            _ => {}
        }
        all.into_iter()
            .find(|c| c.labels.get(labels::NAME).map(String::as_str) == Some(target))
            .ok_or_else(|| RuneError::NoSuchContainer(target.to_string()))
    }

    /// Current task of a container, `None` when there is none
    pub async fn task(&self, id: &str) -> Result<Option<TaskInfo>> {
        match self.client.tasks.get(&self.scope, id).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn view(&self, record: ContainerRecord) -> Result<ContainerView> {
        let task = self.task(&record.id).await?;
        Ok(ContainerView {
            labels: InternalLabels::from_labels(&record.labels),
            record,
            task,
        })
    }

    /// Containers of the namespace, oldest first; running ones only unless `all`
    pub async fn list(&self, all: bool) -> Result<Vec<ContainerView>> {
        let mut out = Vec::new();
        for record in self.client.containers.list(&self.scope).await? {
            let view = self.view(record).await?;
            if all || view.is_running() {
                out.push(view);
            }
        }
        out.sort_by_key(|v| v.record.created_at);
        Ok(out)
    }

    /// Snapshot mounts for the task rootfs; empty with `--rootfs`
    async fn rootfs_mounts(&self, record: &ContainerRecord) -> Result<Vec<Mount>> {
        if record.snapshot_key.is_empty() {
            return Ok(Vec::new());
        }
        self.client
            .snapshots
            .mounts(&self.scope, &record.snapshotter, &record.snapshot_key)
            .await
    }

    /// Drop a leftover stopped task so a new one can be created.
    ///
    /// Returns `false` when the container is already running.
    async fn clear_stale_task(&self, id: &str) -> Result<bool> {
        match self.task(id).await? {
            Some(t) if matches!(t.status, TaskStatus::Running | TaskStatus::Paused | TaskStatus::Pausing) => Ok(false),
            Some(_) => {
                ignore_not_found(self.client.tasks.delete(&self.scope, id).await)?;
                Ok(true)
            }
            None => Ok(true),
        }
    }

    async fn after_task_start(&self, record: &ContainerRecord, pid: u32) -> Result<()> {
        let internal = InternalLabels::from_labels(&record.labels);
        if let Some(pid_file) = &internal.pid_file {
            atomic_write(Path::new(pid_file), format!("{}\n", pid).as_bytes(), 0o644)?;
        }
        let mut update = HashMap::new();
        update.insert(labels::RESTART_EXPLICITLY_STOPPED.to_string(), "false".to_string());
        if record.labels.contains_key(labels::RESTART_POLICY) {
            update.insert(labels::RESTART_STATUS.to_string(), "running".to_string());
        }
        self.client.containers.update_labels(&self.scope, &record.id, update).await
    }

    /// Start with output going to the container log
    pub async fn start_detached(&self, record: &ContainerRecord) -> Result<()> {
        if !self.clear_stale_task(&record.id).await? {
            debug!("container {} already running", record.id);
            return Ok(());
        }
        let internal = InternalLabels::from_labels(&record.labels);
        // The logging child recreates what it needs under the state dir.
        self.data.ensure_container_dir(self.namespace(), &record.id)?;
        let io = match &internal.log_uri {
            Some(uri) => TaskIo {
                stdin: String::new(),
                stdout: uri.clone(),
                stderr: uri.clone(),
                terminal: spec_terminal(record),
            },
            None => TaskIo::default(),
        };
        let rootfs = self.rootfs_mounts(record).await?;
        self.client.tasks.create(&self.scope, &record.id, &rootfs, &io).await?;
        let pid = self.client.tasks.start(&self.scope, &record.id, "").await?;
        self.after_task_start(record, pid).await?;
        info!("started container {} (pid {})", record.id, pid);
        Ok(())
    }

    /// Start with stdio attached to ours; returns the exit status
    pub async fn start_attached(&self, record: &ContainerRecord, interactive: bool) -> Result<u32> {
        if !self.clear_stale_task(&record.id).await? {
            return Err(RuneError::usage(format!(
                "container {} is already running, cannot attach",
                record.id
            )));
        }
        let tty = spec_terminal(record);
        let state_dir = self.data.ensure_container_dir(self.namespace(), &record.id)?;
        let _raw = if wants_raw_mode(tty, std::io::stdin().is_terminal()) {
            Some(RawModeGuard::enable()?)
        } else {
            None
        };

        let log_config = LogConfig::load(&state_dir)?;
        let log = if log_config.driver == LogDriver::JsonFile {
            let path = self.data.log_path(self.namespace(), &record.id);
            Some(Arc::new(Mutex::new(JsonFileWriter::open(&path, log_config)?)))
        } else {
            None
        };

        let fifos = FifoSet::create(&state_dir, "init", interactive, tty)?;
        let io = fifos.task_io();
        let attached = Attached::start(fifos, log);

        let res = self.attached_task(record, &io, tty).await;
        tokio::task::spawn_blocking(move || attached.finish())
            .await
            .map_err(|e| RuneError::Internal(format!("stdio copier: {}", e)))?;
        res
    }

    async fn attached_task(&self, record: &ContainerRecord, io: &TaskIo, tty: bool) -> Result<u32> {
        let id = record.id.clone();
        let rootfs = self.rootfs_mounts(record).await?;
        self.client.tasks.create(&self.scope, &id, &rootfs, io).await?;

        // Registered before start so a fast exit is never missed.
        let waiter = {
            let client = self.client.clone();
            let scope = self.scope.clone();
            let id = id.clone();
            tokio::spawn(async move { client.tasks.wait(&scope, &id, "").await })
        };

        let pid = self.client.tasks.start(&self.scope, &id, "").await?;
        self.after_task_start(record, pid).await?;
        if tty {
            if let Some((w, h)) = console_size() {
                if let Err(e) = self.client.tasks.resize(&self.scope, &id, "", w, h).await {
                    debug!("initial resize of {} failed: {}", id, e);
                }
            }
        }
        let forwarder = forward_signals(self.client.clone(), self.scope.clone(), id.clone(), String::new(), tty)?;
        let status = waiter
            .await
            .map_err(|e| RuneError::Internal(format!("wait task: {}", e)))?;
        forwarder.abort();
        status
    }

    /// `run`: create, then start detached or attached.
    ///
    /// Returns the container id. An attached container that exits non-zero
    /// yields [`RuneError::ExitCode`].
    pub async fn run(&self, opts: &CreateOptions) -> Result<String> {
        let record = self.create(opts).await?;
        if opts.detach {
            if let Err(e) = self.start_detached(&record).await {
                if opts.rm {
                    self.remove_quietly(&record.id).await;
                }
                return Err(e);
            }
            return Ok(record.id);
        }

        let outcome = self.start_attached(&record, opts.interactive).await;
        if opts.rm {
            self.remove_quietly(&record.id).await;
        }
        match outcome? {
            0 => Ok(record.id),
            code => Err(RuneError::ExitCode(code as i32)),
        }
    }

    async fn remove_quietly(&self, id: &str) {
        let opts = RemoveOptions { force: true, volumes: true };
        if let Err(e) = self.remove(id, opts).await {
            warn!("failed to remove container {}: {}", id, e);
        }
    }

    /// Stop a container: its stop signal, then SIGKILL after `timeout`
    pub async fn stop(&self, target: &str, timeout: Option<u32>) -> Result<()> {
        let record = self.lookup(target).await?;
        let id = record.id.clone();
        let internal = InternalLabels::from_labels(&record.labels);

        let mut update = HashMap::new();
        update.insert(labels::RESTART_EXPLICITLY_STOPPED.to_string(), "true".to_string());
        if record.labels.contains_key(labels::RESTART_POLICY) {
            update.insert(labels::RESTART_STATUS.to_string(), "stopped".to_string());
        }
        self.client.containers.update_labels(&self.scope, &id, update).await?;

        let task = self.task(&id).await?;
        if let Some(task) = task.filter(|t| !matches!(t.status, TaskStatus::Created | TaskStatus::Stopped)) {
            let signal = match &internal.stop_signal {
                Some(s) => parse_signal(s)?,
                None => libc::SIGTERM as u32,
            };
            let timeout = timeout.or(internal.stop_timeout).unwrap_or(DEFAULT_STOP_TIMEOUT);
            self.terminate(&id, task.status, signal, Duration::from_secs(timeout as u64))
                .await?;
        }

        if internal.auto_remove {
            self.remove(&id, RemoveOptions { force: true, volumes: true }).await?;
        }
        Ok(())
    }

    async fn terminate(&self, id: &str, status: TaskStatus, signal: u32, timeout: Duration) -> Result<()> {
        let mut waiter = {
            let client = self.client.clone();
            let scope = self.scope.clone();
            let id = id.to_string();
            tokio::spawn(async move { client.tasks.wait(&scope, &id, "").await })
        };

        self.client.tasks.kill(&self.scope, id, "", signal, false).await?;
        if status == TaskStatus::Paused {
            // Signals reach a frozen process only once it is thawed.
            self.client.tasks.resume(&self.scope, id).await?;
        }

        if let Ok(res) = tokio::time::timeout(timeout, &mut waiter).await {
            return match res.map_err(|e| RuneError::Internal(format!("wait task: {}", e)))? {
                Err(RuneError::Canceled) => Err(RuneError::StopCanceled(id.to_string())),
                other => other.map(|_| ()),
            };
        }

        debug!("container {} ignored signal {}, killing", id, signal);
        self.client.tasks.kill(&self.scope, id, "", libc::SIGKILL as u32, true).await?;
        tokio::select! {
            res = waiter => match res.map_err(|e| RuneError::Internal(format!("wait task: {}", e)))? {
                Err(RuneError::Canceled) => Err(RuneError::StopCanceled(id.to_string())),
                other => other.map(|_| ()),
            },
            _ = self.scope.token().cancelled() => Err(RuneError::StopCanceled(id.to_string())),
        }
    }

    /// Send `signal` to the init process of a running container
    pub async fn kill(&self, target: &str, signal: u32) -> Result<()> {
        let record = self.lookup(target).await?;
        match self.task(&record.id).await? {
            Some(t) if matches!(t.status, TaskStatus::Running | TaskStatus::Paused) => {
                self.client.tasks.kill(&self.scope, &record.id, "", signal, false).await
            }
            _ => Err(RuneError::NotRunning(record.id)),
        }
    }

    pub async fn pause(&self, target: &str) -> Result<()> {
        let record = self.lookup(target).await?;
        match self.task(&record.id).await? {
            Some(t) if t.status == TaskStatus::Running => self.client.tasks.pause(&self.scope, &record.id).await,
            _ => Err(RuneError::NotRunning(record.id)),
        }
    }

    pub async fn unpause(&self, target: &str) -> Result<()> {
        let record = self.lookup(target).await?;
        match self.task(&record.id).await? {
            Some(t) if t.status == TaskStatus::Paused => self.client.tasks.resume(&self.scope, &record.id).await,
            _ => Err(RuneError::usage(format!("container {} is not paused", record.id))),
        }
    }

    /// Block until the container exits; returns its exit status.
    ///
    /// A container that was never started is waited on from the moment a
    /// task shows up for it.
    pub async fn wait(&self, target: &str) -> Result<u32> {
        let record = self.lookup(target).await?;
        let task = loop {
            if let Some(task) = self.task(&record.id).await? {
                break task;
            }
            self.scope
                .run(async {
                    tokio::time::sleep(WAIT_POLL).await;
                    Ok(())
                })
                .await?;
            self.client.containers.get(&self.scope, &record.id).await?;
        };
        let code = match task {
            TaskInfo {
                status: TaskStatus::Stopped,
                exit_status,
                ..
            } => exit_status.unwrap_or_default(),
            _ => self.client.tasks.wait(&self.scope, &record.id, "").await?,
        };
        if InternalLabels::from_labels(&record.labels).auto_remove {
            self.remove(&record.id, RemoveOptions { force: true, volumes: true }).await?;
        }
        Ok(code)
    }

    /// Remove a container and everything the engine allocated for it.
    ///
    /// Each teardown step runs even when an earlier one failed; not-found
    /// counts as done. The first hard error is returned.
    pub async fn remove(&self, target: &str, opts: RemoveOptions) -> Result<()> {
        let record = self.lookup(target).await?;
        let id = record.id.clone();
        let ns = self.namespace().to_string();
        let internal = InternalLabels::from_labels(&record.labels);

        if let Some(task) = self.task(&id).await? {
            match task.status {
                TaskStatus::Created | TaskStatus::Stopped => {}
                TaskStatus::Paused if !opts.force => return Err(RuneError::ContainerPaused(id)),
                TaskStatus::Paused => {
                    // The task may exit on its own at any point; NotFound means it is gone.
                    ignore_not_found(self.client.tasks.kill(&self.scope, &id, "", libc::SIGKILL as u32, true).await)?;
                    ignore_not_found(self.client.tasks.resume(&self.scope, &id).await)?;
                    ignore_not_found(self.client.tasks.wait(&self.scope, &id, "").await)?;
                }
                _ if !opts.force => return Err(RuneError::ContainerRunning(id)),
                _ => {
                    ignore_not_found(self.client.tasks.kill(&self.scope, &id, "", libc::SIGKILL as u32, true).await)?;
                    ignore_not_found(self.client.tasks.wait(&self.scope, &id, "").await)?;
                }
            }
        }

        let mut first: Option<RuneError> = None;
        let mut step = |what: &str, res: Result<()>| {
            if let Err(e) = ignore_not_found(res) {
                warn!("failed to {} for {}: {}", what, id, e);
                first.get_or_insert(e);
            }
        };

        step("delete task", self.client.tasks.delete(&self.scope, &id).await.map(|_| ()));
        step("delete container", self.client.containers.delete(&self.scope, &id).await);
        if !record.snapshot_key.is_empty() {
            step(
                "remove snapshot",
                self.client
                    .snapshots
                    .remove(&self.scope, &record.snapshotter, &record.snapshot_key)
                    .await,
            );
        }
        if let Some(name) = &internal.name {
            step(
                "release name",
                NameStore::open(&self.data, &ns).and_then(|s| s.release(name, &id)),
            );
        }
        step("release hosts entry", HostsStore::open(&self.data, &ns).and_then(|h| h.release(&id)));
        step(
            "remove state directory",
            std::fs::remove_dir_all(self.data.container_dir(&ns, &id)).map_err(RuneError::from),
        );
        if opts.volumes && !internal.anonymous_volumes.is_empty() {
            match VolumeStore::open(&self.data, &ns) {
                Ok(store) => {
                    for v in &internal.anonymous_volumes {
                        step("remove volume", store.remove(v));
                    }
                }
                Err(e) => step("open volume store", Err(e)),
            }
        }

        match first {
            Some(e) => Err(e),
            None => {
                info!("removed container {}", id);
                Ok(())
            }
        }
    }
}

/// Whether the stored spec asks for a terminal
fn spec_terminal(record: &ContainerRecord) -> bool {
    record
        .spec
        .as_ref()
        .and_then(|s| s.pointer("/process/terminal"))
        .and_then(|t| t.as_bool())
        .unwrap_or(false)
}

fn resolve_user(root: &Path, user: Option<&str>, group_add: &[String]) -> Result<ResolvedUser> {
    match user {
        Some(u) => UserDb::load(root)?.resolve(u, group_add),
        None if !group_add.is_empty() => UserDb::load(root)?.resolve("0", group_add),
        None => Ok(ResolvedUser::default()),
    }
}

/// `<image base name>-<first 5 hex of id>`
fn default_name(image: &str, id: &str) -> String {
    let base = image.trim_end_matches('/').rsplit('/').next().unwrap_or(image);
    let base = base.split(['@', ':']).next().unwrap_or(base);
    let clean: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let clean = clean.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    if clean.is_empty() {
        id[..12].to_string()
    } else {
        format!("{}-{}", clean, &id[..5])
    }
}
