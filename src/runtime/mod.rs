//! Host-side runtime helpers
//!
//! The OCI runtime itself is external; this module holds the syscalls the
//! engine still issues on the host.

pub mod mount;
pub mod syscall;

pub use mount::{bind_private, unmount_detach, Mounter, SystemMounter};
