//! libc wrappers for host-side mounts and FIFOs
//!
//! Thin wrappers over libc for the few host operations the engine performs
//! itself: mounting snapshot views, binding resolv.conf in hooks, and
//! creating the FIFOs that carry container stdio.

use std::ffi::CString;
use std::io;
use std::path::Path;

/// `mount(2)` flags widened to the `u64` the option parser works in
pub mod mount_flags {
    pub const MS_RDONLY: u64 = libc::MS_RDONLY as u64;
    pub const MS_NOSUID: u64 = libc::MS_NOSUID as u64;
    pub const MS_NODEV: u64 = libc::MS_NODEV as u64;
    pub const MS_NOEXEC: u64 = libc::MS_NOEXEC as u64;
    pub const MS_REMOUNT: u64 = libc::MS_REMOUNT as u64;
    pub const MS_BIND: u64 = libc::MS_BIND as u64;
    pub const MS_REC: u64 = libc::MS_REC as u64;
    pub const MS_PRIVATE: u64 = libc::MS_PRIVATE as u64;
    pub const MS_SLAVE: u64 = libc::MS_SLAVE as u64;
    pub const MS_SHARED: u64 = libc::MS_SHARED as u64;
}

/// `umount2(2)` flags
pub mod umount_flags {
    pub const MNT_FORCE: i32 = libc::MNT_FORCE;
    pub const MNT_DETACH: i32 = libc::MNT_DETACH;
}

pub type SyscallResult<T> = std::result::Result<T, io::Error>;

fn cstring(s: &str, what: &str) -> SyscallResult<CString> {
    CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid {}", what)))
}

fn path_cstring(p: &Path) -> SyscallResult<CString> {
    cstring(&p.to_string_lossy(), "path")
}

/// `mount(2)`; `None` arguments are passed as null
pub fn mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: u64,
    data: Option<&str>,
) -> SyscallResult<()> {
    let source_cstr = source.map(|s| cstring(s, "source")).transpose()?;
    let target_cstr = path_cstring(target)?;
    let fstype_cstr = fstype.map(|s| cstring(s, "fstype")).transpose()?;
    let data_cstr = data.map(|s| cstring(s, "data")).transpose()?;

    let ptr = |c: &Option<CString>| c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr());
    let (source_ptr, fstype_ptr) = (ptr(&source_cstr), ptr(&fstype_cstr));
    let data_ptr = data_cstr
        .as_ref()
        .map(|s| s.as_ptr() as *const libc::c_void)
        .unwrap_or(std::ptr::null());

    let result = unsafe {
        libc::mount(
            source_ptr,
            target_cstr.as_ptr(),
            fstype_ptr,
            flags as libc::c_ulong,
            data_ptr,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn umount2(target: &Path, flags: i32) -> SyscallResult<()> {
    let target_cstr = path_cstring(target)?;
    let result = unsafe { libc::umount2(target_cstr.as_ptr(), flags) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Create a named pipe
pub fn mkfifo(path: &Path, mode: u32) -> SyscallResult<()> {
    let path_cstr = path_cstring(path)?;
    let result = unsafe { libc::mkfifo(path_cstr.as_ptr(), mode as libc::mode_t) };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Split a device number into (major, minor)
pub fn device_numbers(rdev: u64) -> (i64, i64) {
    let major = unsafe { libc::major(rdev as libc::dev_t) };
    let minor = unsafe { libc::minor(rdev as libc::dev_t) };
    (major as i64, minor as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn test_mkfifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        mkfifo(&path, 0o600).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
        assert_eq!(mkfifo(&path, 0o600).unwrap_err().kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_device_numbers() {
        use std::os::unix::fs::MetadataExt;
        let rdev = std::fs::metadata("/dev/null").unwrap().rdev();
        assert_eq!(device_numbers(rdev), (1, 3));
    }

    #[test]
    fn test_umount_not_mounted() {
        let dir = tempfile::tempdir().unwrap();
        assert!(umount2(dir.path(), umount_flags::MNT_DETACH).is_err());
    }
}
