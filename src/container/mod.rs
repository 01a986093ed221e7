//! Container management
//!
//! Creation turns user flags and image defaults into an OCI runtime spec,
//! a rootfs snapshot and a daemon container record. The lifecycle
//! operations then drive the daemon's task API.

pub mod exec;
pub mod format;
pub mod io;
pub mod labels;
pub mod lifecycle;
pub mod mounts;
pub mod options;
pub mod spec;
pub mod user;

pub use exec::ExecOptions;
pub use labels::InternalLabels;
pub use lifecycle::{ContainerManager, ContainerView, RemoveOptions};
pub use options::{CreateOptions, LogConfig, LogDriver, RestartPolicy};
