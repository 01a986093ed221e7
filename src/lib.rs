//! runectl - A Docker-compatible command line for containerd
//!
//! runectl is part of the Rune tool family. It drives a containerd daemon
//! over its socket and provides the Docker container workflow on top:
//!
//! - Container lifecycle (`run`, `exec`, `stop`, `rm`, ...)
//! - Image pull, push, tagging and archive import/export
//! - CNI networking with per-network hosts files and port publishing
//! - Named and anonymous volumes
//! - json-file container logs written by a re-entrant logging child

pub mod cli;
pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod hook;
pub mod image;
pub mod logging;
pub mod network;
pub mod runtime;
pub mod storage;

pub use error::{Result, RuneError};
