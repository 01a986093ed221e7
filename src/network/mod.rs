//! Network management module
//!
//! Network configs live as plugin-list documents in the network config
//! directory. Containers join them through the plugin chain, driven from
//! the OCI hook.

pub mod cni;
pub mod config;
pub mod manager;
pub mod ports;
pub mod resolvconf;

pub use cni::{Attachment, AttachResult, CniRunner};
pub use config::{CreateNetworkOptions, NetworkConfig, NetworkDriver};
pub use manager::{NetworkManager, NetworkMode};
pub use ports::PortMapping;
