//! Host mount management
//!
//! Snapshot mounts returned by the daemon are materialized on the host when
//! the engine needs to read an image filesystem (copy-up, passwd lookup),
//! and the OCI hook binds the generated resolv.conf into a container root.

use super::syscall::{mount, mount_flags, umount2, umount_flags};
use crate::daemon::Mount;
use crate::error::{Result, RuneError};
use std::path::Path;
use tracing::debug;

/// Mounts daemon mount lists onto host paths
pub trait Mounter: Send + Sync {
    /// Mount every entry of `mounts` at `target`, in order
    fn mount_all(&self, mounts: &[Mount], target: &Path) -> Result<()>;
    /// Undo `mount_all`, detaching lazily
    fn unmount_all(&self, target: &Path) -> Result<()>;
}

/// Flags and leftover data of a mount option list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub flags: u64,
    pub propagation: u64,
    pub data: Vec<String>,
}

/// Split `options` into mount(2) flags, a propagation change and fs data
pub fn parse_options(options: &[String]) -> MountOptions {
    let mut flags = 0u64;
    let mut propagation = 0u64;
    let mut data = Vec::new();

    for opt in options {
        match opt.as_str() {
            "ro" => flags |= mount_flags::MS_RDONLY,
            "rw" => flags &= !mount_flags::MS_RDONLY,
            "bind" => flags |= mount_flags::MS_BIND,
            "rbind" => flags |= mount_flags::MS_BIND | mount_flags::MS_REC,
            "nosuid" => flags |= mount_flags::MS_NOSUID,
            "nodev" => flags |= mount_flags::MS_NODEV,
            "noexec" => flags |= mount_flags::MS_NOEXEC,
            "private" => propagation = mount_flags::MS_PRIVATE,
            "rprivate" => propagation = mount_flags::MS_PRIVATE | mount_flags::MS_REC,
            "slave" => propagation = mount_flags::MS_SLAVE,
            "rslave" => propagation = mount_flags::MS_SLAVE | mount_flags::MS_REC,
            "shared" => propagation = mount_flags::MS_SHARED,
            "rshared" => propagation = mount_flags::MS_SHARED | mount_flags::MS_REC,
            other => data.push(other.to_string()),
        }
    }

    MountOptions { flags, propagation, data }
}

/// Mounter backed by mount(2)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl SystemMounter {
    fn mount_one(&self, m: &Mount, target: &Path) -> Result<()> {
        let opts = parse_options(&m.options);
        let data = opts.data.join(",");
        let fstype = if opts.flags & mount_flags::MS_BIND != 0 { None } else { Some(m.typ.as_str()) };

        mount(
            Some(&m.source),
            target,
            fstype,
            opts.flags & !mount_flags::MS_RDONLY,
            (!data.is_empty()).then_some(data.as_str()),
        )
        .map_err(|e| RuneError::Internal(format!("mount {} at {}: {}", m.source, target.display(), e)))?;

        // Bind mounts only honour MS_RDONLY on remount.
        if opts.flags & mount_flags::MS_RDONLY != 0 {
            let flags = opts.flags | mount_flags::MS_REMOUNT;
            mount(None, target, None, flags, None)
                .map_err(|e| RuneError::Internal(format!("remount {} read-only: {}", target.display(), e)))?;
        }
        if opts.propagation != 0 {
            mount(None, target, None, opts.propagation, None)
                .map_err(|e| RuneError::Internal(format!("set propagation on {}: {}", target.display(), e)))?;
        }
        Ok(())
    }
}

impl Mounter for SystemMounter {
    fn mount_all(&self, mounts: &[Mount], target: &Path) -> Result<()> {
        for (i, m) in mounts.iter().enumerate() {
            if let Err(e) = self.mount_one(m, target) {
                for _ in 0..i {
                    let _ = umount2(target, umount_flags::MNT_DETACH);
                }
                return Err(e);
            }
            debug!("mounted {} ({}) at {}", m.source, m.typ, target.display());
        }
        Ok(())
    }

    fn unmount_all(&self, target: &Path) -> Result<()> {
        // Stacked mounts come off one at a time until EINVAL.
        loop {
            match umount2(target, umount_flags::MNT_DETACH) {
                Ok(()) => continue,
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Bind `source` over `target` with private propagation
pub fn bind_private(source: &Path, target: &Path) -> Result<()> {
    let source = source.to_string_lossy();
    mount(Some(&source), target, None, mount_flags::MS_BIND, None)?;
    mount(None, target, None, mount_flags::MS_PRIVATE, None)?;
    Ok(())
}

/// Lazily force-unmount `target`; a target that is not mounted is fine
pub fn unmount_detach(target: &Path) -> Result<()> {
    match umount2(target, umount_flags::MNT_DETACH | umount_flags::MNT_FORCE) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_bind_options() {
        let o = parse_options(&opts(&["rbind", "ro", "rprivate"]));
        assert_ne!(o.flags & mount_flags::MS_BIND, 0);
        assert_ne!(o.flags & mount_flags::MS_REC, 0);
        assert_ne!(o.flags & mount_flags::MS_RDONLY, 0);
        assert_eq!(o.propagation, mount_flags::MS_PRIVATE | mount_flags::MS_REC);
        assert!(o.data.is_empty());
    }

    #[test]
    fn test_parse_overlay_data() {
        let o = parse_options(&opts(&["index=off", "lowerdir=/a:/b", "workdir=/w", "upperdir=/u"]));
        assert_eq!(o.flags, 0);
        assert_eq!(o.data.join(","), "index=off,lowerdir=/a:/b,workdir=/w,upperdir=/u");
    }

    #[test]
    fn test_unmount_detach_tolerates_unmounted() {
        let dir = tempfile::tempdir().unwrap();
        // EINVAL for a plain directory, EPERM without privileges
        let res = unmount_detach(dir.path());
        if let Err(RuneError::Io(e)) = &res {
            assert_eq!(e.raw_os_error(), Some(libc::EPERM));
        }
    }
}
