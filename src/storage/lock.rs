//! Advisory directory lock
//!
//! An exclusive `flock(2)` on a sentinel file inside the locked directory.
//! The lock is not reentrant: taking it twice from the same process on
//! different file descriptors deadlocks.

use crate::error::{Result, RuneError};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

const SENTINEL: &str = ".runectl.lock";

/// RAII guard for an exclusive directory lock.
///
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
}

impl DirLock {
    /// Block until the lock on `dir` is held
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(SENTINEL))?;

        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(RuneError::Lock(format!(
                    "failed to lock {}: {}",
                    dir.display(),
                    err
                )));
            }
        }

        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Run `f` while holding the lock on `dir`. Released on every exit path.
pub fn with_dir_lock<T>(dir: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = DirLock::acquire(dir)?;
    f()
}
