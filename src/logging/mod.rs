//! Container log capture
//!
//! Detached containers hand their stdio to a logging child: the shim
//! re-executes this binary with the sentinel below, passing the streams as
//! fds 3 and 4 and a readiness pipe as fd 5.

pub mod jsonfile;
pub mod reader;

pub use jsonfile::{JsonFileWriter, LogRecord};
pub use reader::{parse_time, read_logs, ReadOptions};

use crate::container::options::LogConfig;
use crate::error::{Result, RuneError};
use crate::storage::DataStore;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::os::fd::FromRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// First argument that selects logging-child mode
pub const SENTINEL: &str = "_RUNECTL_INTERNAL_LOGGING";

const STDOUT_FD: i32 = 3;
const STDERR_FD: i32 = 4;
const READY_FD: i32 = 5;

/// Log URI the shim understands; query pairs become argv
pub fn log_uri(exe: &Path, data_store: &Path) -> String {
    format!("binary://{}?{}={}", exe.display(), SENTINEL, data_store.display())
}

/// Copy line-delimited records from `source` until EOF
pub fn pump<R: Read>(source: R, stream: &str, writer: &Mutex<JsonFileWriter>) -> Result<()> {
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let mut w = writer.lock().map_err(|_| RuneError::Lock("log writer poisoned".into()))?;
        w.write(stream, &line)?;
    }
}

/// Entry point of the logging child.
///
/// The shim sets `CONTAINER_ID` and `CONTAINER_NAMESPACE`; `data_store` is
/// the engine's data store root for the daemon.
pub fn run_logging_child(data_store: &Path) -> Result<()> {
    let id = std::env::var("CONTAINER_ID").map_err(|_| RuneError::InvalidConfig("CONTAINER_ID not set".into()))?;
    let namespace = std::env::var("CONTAINER_NAMESPACE")
        .map_err(|_| RuneError::InvalidConfig("CONTAINER_NAMESPACE not set".into()))?;

    let store = DataStore::new(data_store);
    let state_dir = store.ensure_container_dir(&namespace, &id)?;
    let config = LogConfig::load(&state_dir)?;
    let writer = Arc::new(Mutex::new(JsonFileWriter::open(&store.log_path(&namespace, &id), config)?));

    // SAFETY: the shim hands these descriptors to us and nothing else owns them.
    let (stdout, stderr, ready) = unsafe {
        (
            File::from_raw_fd(STDOUT_FD),
            File::from_raw_fd(STDERR_FD),
            File::from_raw_fd(READY_FD),
        )
    };
    drop(ready);
    debug!("logging child ready for {}/{}", namespace, id);

    let handles: Vec<_> = [(stdout, "stdout"), (stderr, "stderr")]
        .into_iter()
        .map(|(source, stream)| {
            let writer = writer.clone();
            std::thread::spawn(move || {
                if let Err(e) = pump(source, stream, &writer) {
                    warn!("log {} stream failed: {}", stream, e);
                }
            })
        })
        .collect();
    for h in handles {
        let _ = h.join();
    }
    Ok(())
}
