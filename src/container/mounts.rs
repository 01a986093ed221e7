//! Mount resolution for `-v`, `--mount` and `--tmpfs`
//!
//! Parsing is pure; [`materialize`] creates volumes, and [`copy_up`] seeds
//! fresh anonymous volumes from the image through a transient snapshot view
//! opened by [`with_image_view`].

use crate::daemon::{Client, Scope};
use crate::error::{Result, RuneError};
use crate::runtime::Mounter;
use crate::storage::volume::{validate_volume_name, VolumeStore};
use oci_spec::runtime::{Mount, MountBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PROPAGATIONS: &[&str] = &["private", "rprivate", "shared", "rshared", "slave", "rslave"];

/// Where a mount's content comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Bind(PathBuf),
    Named(String),
    Anonymous,
    Tmpfs,
}

/// One requested mount, before any volume exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub source: MountSource,
    pub destination: String,
    pub readonly: bool,
    /// `rro`: read-only applied to every submount
    pub recursive_readonly: bool,
    pub propagation: Option<String>,
    /// `bind` instead of `rbind`
    pub nonrecursive: bool,
    /// Extra tmpfs options such as `size=` and `mode=`
    pub tmpfs_options: Vec<String>,
    /// Create a missing bind source instead of failing
    pub create_source: bool,
    /// Came from an image `VOLUME`
    pub from_image: bool,
}

impl MountRequest {
    fn new(source: MountSource, destination: &str) -> Self {
        Self {
            source,
            destination: destination.to_string(),
            readonly: false,
            recursive_readonly: false,
            propagation: None,
            nonrecursive: false,
            tmpfs_options: Vec::new(),
            create_source: false,
            from_image: false,
        }
    }
}

/// Mount as reported by `inspect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    #[serde(rename = "Type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub source: String,
    pub destination: String,
    pub mode: String,
    #[serde(rename = "RW")]
    pub rw: bool,
    pub propagation: String,
}

/// A volume that should be seeded from the image before first start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyUp {
    pub destination: String,
    pub volume_dir: PathBuf,
}

/// Output of [`materialize`]
#[derive(Debug, Clone, Default)]
pub struct ResolvedMounts {
    pub mounts: Vec<Mount>,
    pub points: Vec<MountPoint>,
    pub anonymous_volumes: Vec<String>,
    pub copy_ups: Vec<CopyUp>,
}

fn clean_destination(raw: &str, what: &str) -> Result<String> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(RuneError::usage(format!(
            "invalid {} {:?}: mount destination must be an absolute path",
            what, raw
        )));
    }
    let mut out = PathBuf::from("/");
    for c in path.components() {
        match c {
            Component::Normal(p) => out.push(p),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    Ok(out.to_string_lossy().into_owned())
}

fn absolute_source(raw: &str) -> Result<PathBuf> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

fn looks_like_path(s: &str) -> bool {
    s.starts_with('/') || s.starts_with('.') || s.starts_with('~')
}

fn apply_mode(req: &mut MountRequest, mode: &str, raw: &str) -> Result<()> {
    match mode {
        "" | "rw" | "z" | "Z" => {}
        "ro" => req.readonly = true,
        "rro" => {
            req.readonly = true;
            req.recursive_readonly = true;
        }
        p if PROPAGATIONS.contains(&p) => {
            if matches!(req.source, MountSource::Named(_) | MountSource::Anonymous) {
                return Err(RuneError::usage(format!(
                    "invalid volume {:?}: propagation applies to bind mounts only",
                    raw
                )));
            }
            req.propagation = Some(p.to_string());
        }
        other => {
            return Err(RuneError::usage(format!("invalid volume {:?}: unknown mode {:?}", raw, other)));
        }
    }
    Ok(())
}

/// Parse `-v [SRC:]DST[:MODE[,MODE]]`
pub fn parse_volume_flag(raw: &str) -> Result<MountRequest> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (src, dst, modes) = match parts.as_slice() {
        [dst] => (None, *dst, None),
        [src, dst] => (Some(*src), *dst, None),
        [src, dst, modes] => (Some(*src), *dst, Some(*modes)),
        _ => return Err(RuneError::usage(format!("invalid volume specification {:?}", raw))),
    };
    let destination = clean_destination(dst, "volume")?;

    let source = match src {
        None | Some("") => MountSource::Anonymous,
        Some(s) if looks_like_path(s) => MountSource::Bind(absolute_source(s)?),
        Some(s) => {
            validate_volume_name(s)?;
            MountSource::Named(s.to_string())
        }
    };
    let mut req = MountRequest::new(source, &destination);
    req.create_source = true;
    for mode in modes.unwrap_or("").split(',') {
        apply_mode(&mut req, mode, raw)?;
    }
    Ok(req)
}

fn parse_bool(key: &str, value: Option<&str>, raw: &str) -> Result<bool> {
    match value {
        None | Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(v) => Err(RuneError::usage(format!("invalid value {:?} for {} in {:?}", v, key, raw))),
    }
}

/// Parse `--mount type=...,source=...,target=...`.
///
/// Keys that do not apply to the mount type are rejected, as are keys
/// given twice under different spellings.
pub fn parse_mount_flag(raw: &str) -> Result<MountRequest> {
    let invalid = |msg: &str| RuneError::usage(format!("invalid mount {:?}: {}", raw, msg));

    let mut typ = None;
    let mut source = None;
    let mut target = None;
    let mut readonly = None;
    let mut recursive_readonly = false;
    let mut propagation = None;
    let mut nonrecursive = None;
    let mut tmpfs_options = Vec::new();
    let mut seen = HashSet::new();

    for field in raw.split(',').filter(|f| !f.is_empty()) {
        let (key, value) = match field.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (field, None),
        };
        let canonical = match key {
            "src" | "source" => "source",
            "dst" | "destination" | "target" => "target",
            "ro" | "readonly" => "readonly",
            other => other,
        };
        if !seen.insert(canonical.to_string()) {
            return Err(invalid(&format!("{} given more than once", canonical)));
        }
        let value_of = |v: Option<&str>| v.map(String::from).ok_or_else(|| invalid(&format!("{} needs a value", key)));
        match canonical {
            "type" => typ = Some(value_of(value)?),
            "source" => source = Some(value_of(value)?),
            "target" => target = Some(value_of(value)?),
            "readonly" => {
                if value == Some("recursive") {
                    readonly = Some(true);
                    recursive_readonly = true;
                } else {
                    readonly = Some(parse_bool(key, value, raw)?);
                }
            }
            "bind-propagation" => {
                let p = value_of(value)?;
                if !PROPAGATIONS.contains(&p.as_str()) {
                    return Err(invalid(&format!("unknown propagation {:?}", p)));
                }
                propagation = Some(p);
            }
            "bind-nonrecursive" => nonrecursive = Some(parse_bool(key, value, raw)?),
            "tmpfs-size" => {
                let size = super::options::parse_size(&value_of(value)?)?;
                tmpfs_options.push(format!("size={}", size));
            }
            "tmpfs-mode" => {
                let mode = value_of(value)?;
                u32::from_str_radix(&mode, 8).map_err(|_| invalid(&format!("invalid tmpfs-mode {:?}", mode)))?;
                tmpfs_options.push(format!("mode={}", mode));
            }
            _ => return Err(invalid(&format!("unknown key {:?}", key))),
        }
    }

    let typ = typ.unwrap_or_else(|| "volume".to_string());
    let target = target.ok_or_else(|| invalid("target is required"))?;
    let destination = clean_destination(&target, "mount")?;

    let bind_only = propagation.is_some() || nonrecursive.is_some();
    let src = match typ.as_str() {
        "bind" => {
            if !tmpfs_options.is_empty() {
                return Err(invalid("tmpfs options are not valid for bind mounts"));
            }
            let s = source.ok_or_else(|| invalid("source is required for bind mounts"))?;
            MountSource::Bind(absolute_source(&s)?)
        }
        "volume" => {
            if bind_only {
                return Err(invalid("bind options are not valid for volumes"));
            }
            if !tmpfs_options.is_empty() {
                return Err(invalid("tmpfs options are not valid for volumes"));
            }
            match source {
                Some(s) if !s.is_empty() => {
                    validate_volume_name(&s)?;
                    MountSource::Named(s)
                }
                _ => MountSource::Anonymous,
            }
        }
        "tmpfs" => {
            if bind_only {
                return Err(invalid("bind options are not valid for tmpfs"));
            }
            if source.is_some() {
                return Err(invalid("source is not valid for tmpfs"));
            }
            MountSource::Tmpfs
        }
        other => return Err(invalid(&format!("unsupported type {:?}", other))),
    };

    let mut req = MountRequest::new(src, &destination);
    req.readonly = readonly.unwrap_or(false);
    req.recursive_readonly = recursive_readonly;
    req.propagation = propagation;
    req.nonrecursive = nonrecursive.unwrap_or(false);
    req.tmpfs_options = tmpfs_options;
    Ok(req)
}

/// Parse `--tmpfs DST[:OPTIONS]`
pub fn parse_tmpfs_flag(raw: &str) -> Result<MountRequest> {
    let (dst, opts) = raw.split_once(':').unwrap_or((raw, ""));
    let destination = clean_destination(dst, "tmpfs")?;
    let mut req = MountRequest::new(MountSource::Tmpfs, &destination);
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" => req.readonly = true,
            "rw" => req.readonly = false,
            other => req.tmpfs_options.push(other.to_string()),
        }
    }
    Ok(req)
}

/// Collect every requested mount plus image volumes no user mount covers.
///
/// Two user mounts on one destination are an error. An image `VOLUME`
/// whose destination a user mount already covers is dropped, whatever the
/// user mount's mode.
pub fn plan(volumes: &[String], mounts: &[String], tmpfs: &[String], image_volumes: &[String]) -> Result<Vec<MountRequest>> {
    let mut requests = Vec::new();
    for v in volumes {
        requests.push(parse_volume_flag(v)?);
    }
    for m in mounts {
        requests.push(parse_mount_flag(m)?);
    }
    for t in tmpfs {
        requests.push(parse_tmpfs_flag(t)?);
    }

    let mut destinations = HashSet::new();
    for req in &requests {
        if !destinations.insert(req.destination.clone()) {
            return Err(RuneError::usage(format!("duplicate mount point: {}", req.destination)));
        }
    }

    for path in image_volumes {
        let destination = clean_destination(path, "image volume")?;
        if destinations.insert(destination.clone()) {
            let mut req = MountRequest::new(MountSource::Anonymous, &destination);
            req.from_image = true;
            requests.push(req);
        } else {
            debug!("image volume {} covered by a user mount", destination);
        }
    }
    Ok(requests)
}

fn build_mount(destination: &str, typ: &str, source: &str, options: Vec<String>) -> Result<Mount> {
    Ok(MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source)
        .options(options)
        .build()?)
}

fn bind_options(req: &MountRequest) -> Result<(Vec<String>, String)> {
    let mut options = vec![if req.nonrecursive { "bind" } else { "rbind" }.to_string()];
    let propagation = req.propagation.clone().unwrap_or_else(|| "rprivate".to_string());
    if req.recursive_readonly {
        if !propagation.ends_with("private") {
            return Err(RuneError::usage(format!(
                "recursive read-only mount on {} requires private propagation, got {}",
                req.destination, propagation
            )));
        }
        if req.nonrecursive {
            return Err(RuneError::usage(format!(
                "recursive read-only mount on {} cannot be non-recursive",
                req.destination
            )));
        }
        options.push("rro".to_string());
    } else if req.readonly {
        options.push("ro".to_string());
    }
    options.push(propagation.clone());
    Ok((options, propagation))
}

fn mode_string(req: &MountRequest) -> String {
    if req.recursive_readonly {
        "rro".to_string()
    } else if req.readonly {
        "ro".to_string()
    } else {
        String::new()
    }
}

/// Create volumes and emit OCI mounts for `requests`, in order
pub fn materialize(requests: &[MountRequest], volumes: &VolumeStore) -> Result<ResolvedMounts> {
    let mut out = ResolvedMounts::default();

    for req in requests {
        match &req.source {
            MountSource::Bind(src) => {
                if !src.exists() {
                    if !req.create_source {
                        return Err(RuneError::usage(format!(
                            "invalid mount config for type \"bind\": bind source path does not exist: {}",
                            src.display()
                        )));
                    }
                    std::fs::create_dir_all(src)?;
                }
                let (options, propagation) = bind_options(req)?;
                let source = src.to_string_lossy().into_owned();
                out.mounts.push(build_mount(&req.destination, "bind", &source, options)?);
                out.points.push(MountPoint {
                    typ: "bind".into(),
                    name: None,
                    source,
                    destination: req.destination.clone(),
                    mode: mode_string(req),
                    rw: !req.readonly,
                    propagation,
                });
            }
            MountSource::Named(_) | MountSource::Anonymous => {
                let volume = match &req.source {
                    MountSource::Named(name) => volumes.get_or_create(name)?,
                    _ => {
                        let v = volumes.create_anonymous()?;
                        out.anonymous_volumes.push(v.name.clone());
                        out.copy_ups.push(CopyUp {
                            destination: req.destination.clone(),
                            volume_dir: v.mountpoint.clone(),
                        });
                        v
                    }
                };
                let (options, _) = bind_options(req)?;
                let source = volume.mountpoint.to_string_lossy().into_owned();
                out.mounts.push(build_mount(&req.destination, "bind", &source, options)?);
                out.points.push(MountPoint {
                    typ: "volume".into(),
                    name: Some(volume.name.clone()),
                    source,
                    destination: req.destination.clone(),
                    mode: mode_string(req),
                    rw: !req.readonly,
                    propagation: String::new(),
                });
            }
            MountSource::Tmpfs => {
                let mut options: Vec<String> = ["nosuid", "nodev", "noexec"].iter().map(|s| s.to_string()).collect();
                if req.readonly {
                    options.push("ro".into());
                }
                options.extend(req.tmpfs_options.iter().cloned());
                out.points.push(MountPoint {
                    typ: "tmpfs".into(),
                    name: None,
                    source: String::new(),
                    destination: req.destination.clone(),
                    mode: options.join(","),
                    rw: !req.readonly,
                    propagation: String::new(),
                });
                out.mounts.push(build_mount(&req.destination, "tmpfs", "tmpfs", options)?);
            }
        }
    }
    Ok(out)
}

/// Copy `root/path` into `dst`, preserving modes, ownership and symlinks.
///
/// A missing source copies nothing; a non-empty `dst` is refused. Stops
/// with `Interrupted` between entries once `stop` is cancelled.
pub fn copy_up(root: &Path, path: &str, dst: &Path, stop: &CancellationToken) -> Result<()> {
    let src = root.join(path.trim_start_matches('/'));
    let meta = match std::fs::symlink_metadata(&src) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Ok(());
    }
    if std::fs::read_dir(dst)?.next().is_some() {
        return Err(RuneError::VolumeNotEmpty(path.to_string()));
    }

    for entry in walkdir::WalkDir::new(&src).min_depth(1).follow_links(false) {
        if stop.is_cancelled() {
            return Err(RuneError::Interrupted);
        }
        let entry = entry.map_err(|e| RuneError::Internal(format!("walk {}: {}", src.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(&src)
            .map_err(|e| RuneError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let ft = meta.file_type();

        if ft.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else if ft.is_dir() {
            std::fs::create_dir(&target)?;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        } else if ft.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else {
            debug!("skipping special file {}", entry.path().display());
            continue;
        }
        // Ownership is best effort for unprivileged runs.
        let _ = std::os::unix::fs::lchown(&target, Some(meta.uid()), Some(meta.gid()));
    }

    let root_meta = std::fs::metadata(&src)?;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(root_meta.mode() & 0o7777))?;
    let _ = std::os::unix::fs::lchown(dst, Some(root_meta.uid()), Some(root_meta.gid()));
    Ok(())
}

/// Run `f` against a read-only view of the snapshot `parent`.
///
/// The view lives under its own lease. Ctrl-C or cancellation of `scope`
/// trips the token handed to `f`; the blocking work is always joined before
/// cleanup, which runs in a fixed order: unmount, remove the view, remove
/// the temporary directory.
pub async fn with_image_view<T, F>(
    client: &Client,
    scope: &Scope,
    snapshotter: &str,
    parent: &str,
    mounter: Arc<dyn Mounter>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&Path, &CancellationToken) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let key = format!("view-{}", nanos);
    let dir = std::env::temp_dir().join(format!("runectl-view-{}", uuid::Uuid::new_v4().simple()));

    client
        .with_lease(scope, |leased| async move {
            let mounts = client.snapshots.view(&leased, snapshotter, &key, parent).await?;
            std::fs::create_dir_all(&dir)?;

            let stop = CancellationToken::new();
            let task_stop = stop.clone();
            let task_dir = dir.clone();
            let task_mounter = mounter.clone();
            let mut work = tokio::task::spawn_blocking(move || {
                if task_stop.is_cancelled() {
                    return Err(RuneError::Interrupted);
                }
                task_mounter.mount_all(&mounts, &task_dir)?;
                if task_stop.is_cancelled() {
                    return Err(RuneError::Interrupted);
                }
                f(&task_dir, &task_stop)
            });
            let join = |res: std::result::Result<Result<T>, tokio::task::JoinError>| {
                res.map_err(|e| RuneError::Internal(format!("image view task: {}", e)))
                    .and_then(|r| r)
            };

            let finished = tokio::select! {
                res = &mut work => Some(join(res)),
                _ = tokio::signal::ctrl_c() => None,
                _ = leased.token().cancelled() => None,
            };
            let out = match finished {
                Some(out) => out,
                None => {
                    stop.cancel();
                    debug!("waiting for image view work to stop");
                    if let Err(e) = join(work.await) {
                        debug!("interrupted image view work: {}", e);
                    }
                    Err(RuneError::Interrupted)
                }
            };

            if let Err(e) = mounter.unmount_all(&dir) {
                warn!("failed to unmount image view {}: {}", dir.display(), e);
            }
            let cleanup = Scope::new(leased.namespace());
            if let Err(e) = client.snapshots.remove(&cleanup, snapshotter, &key).await {
                warn!("failed to remove view snapshot {}: {}", key, e);
            }
            // Never recursive: a stuck mount must not lose image content.
            if let Err(e) = std::fs::remove_dir(&dir) {
                warn!("failed to remove {}: {}", dir.display(), e);
            }
            out
        })
        .await
}
