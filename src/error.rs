//! Error types for runectl

use thiserror::Error;

/// Result type for runectl operations
pub type Result<T> = std::result::Result<T, RuneError>;

/// runectl error types
#[derive(Error, Debug)]
pub enum RuneError {
    #[error("{0}")]
    Usage(String),

    #[error("cannot access containerd socket {address:?}: {reason}")]
    UnreachableDaemon { address: String, reason: String },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("failed to pull image {reference}: {reason}")]
    ImagePullFailed { reference: String, reason: String },

    #[error("image verification failed for {reference}: {reason}")]
    ImageVerificationFailed { reference: String, reason: String },

    #[error("name {name:?} is already used by ID {id:?}")]
    NameAlreadyInUse { name: String, id: String },

    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("multiple IDs found with provided prefix: {0}")]
    AmbiguousId(String),

    #[error("container {0} is running: stop the container before removing or force remove")]
    ContainerRunning(String),

    #[error("container {0} is paused: unpause the container before removing or force remove")]
    ContainerPaused(String),

    #[error("container {0} is not running")]
    NotRunning(String),

    #[error("currently flag -t and -d cannot be specified together")]
    TtyDetachConflict,

    #[error("currently flag -i and -d cannot be specified together")]
    InteractiveDetachConflict,

    #[error("no command specified and the image has no entrypoint or cmd")]
    NoCommand,

    #[error("conflict: unable to remove repository reference {reference:?} (must force) - container {container} is using its referenced image")]
    ImageInUse { reference: String, container: String },

    #[error("volume target {0:?} is not empty")]
    VolumeNotEmpty(String),

    #[error("volume {0:?} already exists with different labels")]
    VolumeExists(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("network {0:?} already exists")]
    NetworkExists(String),

    #[error("cannot derive a default subnet for network id {0}, specify --subnet")]
    SubnetExhausted(u32),

    #[error("failed to find plugin {plugin:?} in path {path:?}")]
    PluginMissing { plugin: String, path: String },

    #[error("network plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("exit status {0}")]
    ExitCode(i32),

    #[error("stop canceled for container {0}")]
    StopCanceled(String),

    #[error("{failed} target(s) failed")]
    Aggregate { failed: usize },

    #[error("operation canceled")]
    Canceled,

    #[error("interrupted")]
    Interrupted,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("containerd: {0}")]
    Rpc(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCI spec error: {0}")]
    Oci(#[from] oci_spec::OciSpecError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuneError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RuneError::ExitCode(code) => *code,
            RuneError::Usage(_)
            | RuneError::TtyDetachConflict
            | RuneError::InteractiveDetachConflict => 125,
            _ => 1,
        }
    }

    /// Whether the error means the target object does not exist.
    ///
    /// Removal paths swallow these.
    pub fn is_not_found(&self) -> bool {
        match self {
            RuneError::NotFound(_)
            | RuneError::NoSuchContainer(_)
            | RuneError::ImageNotFound(_)
            | RuneError::VolumeNotFound(_)
            | RuneError::NetworkNotFound(_) => true,
            RuneError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        RuneError::Usage(msg.into())
    }
}

/// Swallow not-found errors, the way every teardown step treats them.
pub fn ignore_not_found<T: Default>(res: Result<T>) -> Result<T> {
    match res {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RuneError::ExitCode(123).exit_code(), 123);
        assert_eq!(RuneError::usage("bad flag").exit_code(), 125);
        assert_eq!(RuneError::TtyDetachConflict.exit_code(), 125);
        assert_eq!(RuneError::NoSuchContainer("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_ignore_not_found() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(ignore_not_found::<()>(Err(RuneError::Io(io))).is_ok());
        assert!(ignore_not_found::<()>(Err(RuneError::NotFound("task".into()))).is_ok());
        assert!(ignore_not_found::<()>(Err(RuneError::ContainerRunning("c".into()))).is_err());
    }
}
