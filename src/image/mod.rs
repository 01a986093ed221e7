//! Image management module
//!
//! This module turns user references into unpacked snapshots: reference
//! parsing, the registry client, pull and unpack through the daemon,
//! signature verification and image archives.

pub mod archive;
pub mod ensure;
pub mod oci;
pub mod reference;
pub mod registry;
pub mod store;
pub mod verify;

pub use ensure::{ensure_image, EnsureOptions, EnsuredImage, PullPolicy};
pub use oci::Platform;
pub use reference::Reference;
pub use registry::{Fetcher, Pusher, RegistryClient};
pub use store::{Image, ImageStore};
pub use verify::{Verifier, VerifyMode};
