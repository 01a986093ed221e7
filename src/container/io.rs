//! Container stdio: FIFOs for attached runs, console handling and signal
//! forwarding

use crate::daemon::{Client, Scope, TaskIo};
use crate::error::{Result, RuneError};
use crate::logging::JsonFileWriter;
use crate::runtime::syscall::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

const FINISH_ATTEMPTS: usize = 500;

/// Named pipes the shim opens for one process
#[derive(Debug)]
pub struct FifoSet {
    dir: PathBuf,
    pub stdin: Option<PathBuf>,
    pub stdout: PathBuf,
    /// Absent with a terminal: the pty merges both streams
    pub stderr: Option<PathBuf>,
    pub terminal: bool,
}

impl FifoSet {
    pub fn create(parent: &Path, exec_id: &str, stdin: bool, terminal: bool) -> Result<Self> {
        let dir = parent.join(format!("fifo-{}-{}", exec_id, uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir)?;
        let make = |name: &str| -> Result<PathBuf> {
            let path = dir.join(name);
            mkfifo(&path, 0o600)?;
            Ok(path)
        };
        Ok(Self {
            stdin: if stdin { Some(make("stdin")?) } else { None },
            stdout: make("stdout")?,
            stderr: if terminal { None } else { Some(make("stderr")?) },
            terminal,
            dir,
        })
    }

    pub fn task_io(&self) -> TaskIo {
        let s = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        TaskIo {
            stdin: s(&self.stdin),
            stdout: self.stdout.to_string_lossy().into_owned(),
            stderr: s(&self.stderr),
            terminal: self.terminal,
        }
    }
}

/// Splits a byte stream into lines for the log writer
struct LineTee {
    stream: &'static str,
    pending: Vec<u8>,
    log: Option<Arc<Mutex<JsonFileWriter>>>,
}

impl LineTee {
    fn feed(&mut self, chunk: &[u8]) {
        let Some(log) = &self.log else { return };
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Ok(mut w) = log.lock() {
                if let Err(e) = w.write(self.stream, &line) {
                    warn!("failed to record log line: {}", e);
                }
            }
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Some(log) = &self.log {
            if let Ok(mut w) = log.lock() {
                let _ = w.write(self.stream, &self.pending);
            }
        }
        self.pending.clear();
    }
}

fn copy_out<W: Write>(fifo: &Path, mut dst: W, mut tee: LineTee) -> std::io::Result<()> {
    let mut src = File::open(fifo)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            tee.flush();
            return Ok(());
        }
        dst.write_all(&buf[..n])?;
        dst.flush()?;
        tee.feed(&buf[..n]);
    }
}

/// Copier threads wired to a [`FifoSet`]
pub struct Attached {
    fifos: FifoSet,
    readers: Vec<JoinHandle<()>>,
}

impl Attached {
    /// Start copying the FIFOs to our stdout/stderr, and our stdin into the
    /// container when it has one. Lines are also recorded in `log`.
    pub fn start(fifos: FifoSet, log: Option<Arc<Mutex<JsonFileWriter>>>) -> Self {
        let mut readers = Vec::new();

        let stdout = fifos.stdout.clone();
        let tee = LineTee { stream: "stdout", pending: Vec::new(), log: log.clone() };
        readers.push(std::thread::spawn(move || {
            if let Err(e) = copy_out(&stdout, std::io::stdout(), tee) {
                debug!("stdout copy ended: {}", e);
            }
        }));

        if let Some(stderr) = fifos.stderr.clone() {
            let tee = LineTee { stream: "stderr", pending: Vec::new(), log };
            readers.push(std::thread::spawn(move || {
                if let Err(e) = copy_out(&stderr, std::io::stderr(), tee) {
                    debug!("stderr copy ended: {}", e);
                }
            }));
        }

        // Never joined: a read on our stdin cannot be interrupted.
        if let Some(stdin) = fifos.stdin.clone() {
            std::thread::spawn(move || {
                let res = OpenOptions::new()
                    .write(true)
                    .open(&stdin)
                    .and_then(|mut dst| std::io::copy(&mut std::io::stdin().lock(), &mut dst));
                if let Err(e) = res {
                    debug!("stdin copy ended: {}", e);
                }
            });
        }

        Self { fifos, readers }
    }

    /// Wait for the output copiers to drain, then remove the FIFOs.
    ///
    /// A copier still blocked in open(2) because the shim never connected
    /// is released by a non-blocking writer open. Copiers whose FIFO stays
    /// held open by a leftover process are abandoned after a grace period.
    pub fn finish(self) {
        let outputs: Vec<PathBuf> = std::iter::once(self.fifos.stdout.clone())
            .chain(self.fifos.stderr.clone())
            .collect();
        for _ in 0..FINISH_ATTEMPTS {
            if self.readers.iter().all(|h| h.is_finished()) {
                break;
            }
            for path in &outputs {
                let _ = OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(path);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        for h in self.readers {
            if h.is_finished() {
                let _ = h.join();
            } else {
                warn!("output copier still attached, detaching");
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.fifos.dir) {
            debug!("failed to remove {}: {}", self.fifos.dir.display(), e);
        }
    }
}

/// Puts the controlling terminal in raw mode until dropped
pub struct RawModeGuard;

/// Raw mode applies whenever a TTY is allocated and stdin is a terminal,
/// with or without `-i`
pub fn wants_raw_mode(tty: bool, stdin_is_terminal: bool) -> bool {
    tty && stdin_is_terminal
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()
            .map_err(|e| RuneError::Internal(format!("failed to set raw mode: {}", e)))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Current console size as (width, height)
pub fn console_size() -> Option<(u32, u32)> {
    crossterm::terminal::size().ok().map(|(w, h)| (w as u32, h as u32))
}

const FORWARDED: &[i32] = &[
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

/// Relay our signals to the process, and console resizes when `tty`.
///
/// Abort the returned handle once the process exited.
pub fn forward_signals(client: Client, scope: Scope, id: String, exec_id: String, tty: bool) -> Result<AbortHandle> {
    let mut streams = Vec::new();
    for sig in FORWARDED {
        streams.push((*sig, signal(SignalKind::from_raw(*sig))?));
    }
    let mut winch = signal(SignalKind::window_change())?;

    let task = tokio::spawn(async move {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<i32>();
        for (sig, mut stream) in streams {
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(sig).is_err() {
                        break;
                    }
                }
            });
        }
        loop {
            tokio::select! {
                Some(sig) = rx.recv() => {
                    debug!("forwarding signal {} to {}", sig, id);
                    if let Err(e) = client.tasks.kill(&scope, &id, &exec_id, sig as u32, false).await {
                        warn!("failed to forward signal {}: {}", sig, e);
                    }
                }
                Some(()) = winch.recv(), if tty => {
                    if let Some((w, h)) = console_size() {
                        let _ = client.tasks.resize(&scope, &id, &exec_id, w, h).await;
                    }
                }
                else => break,
            }
        }
    });
    Ok(task.abort_handle())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::options::LogConfig;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn test_raw_mode_follows_tty() {
        assert!(wants_raw_mode(true, true));
        assert!(!wants_raw_mode(true, false));
        assert!(!wants_raw_mode(false, true));
    }

    #[test]
    fn test_fifo_set_layout() {
        let dir = tempfile::tempdir().unwrap();
        let fifos = FifoSet::create(dir.path(), "init", true, false).unwrap();
        assert!(std::fs::metadata(fifos.stdin.as_ref().unwrap()).unwrap().file_type().is_fifo());
        assert!(fifos.stderr.is_some());
        let io = fifos.task_io();
        assert!(!io.terminal);
        assert!(io.stderr.ends_with("stderr"));

        let tty = FifoSet::create(dir.path(), "exec1", false, true).unwrap();
        assert!(tty.stdin.is_none());
        assert!(tty.stderr.is_none());
        assert!(tty.task_io().stderr.is_empty());
    }

    #[test]
    fn test_finish_releases_unconnected_readers() {
        let dir = tempfile::tempdir().unwrap();
        let fifos = FifoSet::create(dir.path(), "init", false, false).unwrap();
        let fifo_dir = fifos.dir.clone();
        let attached = Attached::start(fifos, None);
        // Nobody ever opens the write ends.
        attached.finish();
        assert!(!fifo_dir.exists());
    }

    #[test]
    fn test_output_is_copied_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("c-json.log");
        let log = Arc::new(Mutex::new(JsonFileWriter::open(&log_path, LogConfig::default()).unwrap()));
        let fifos = FifoSet::create(dir.path(), "init", false, true).unwrap();
        let stdout = fifos.stdout.clone();
        let attached = Attached::start(fifos, Some(log));

        let mut w = OpenOptions::new().write(true).open(&stdout).unwrap();
        w.write_all(b"hello\nwor").unwrap();
        w.write_all(b"ld\n").unwrap();
        drop(w);
        attached.finish();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let logs: Vec<crate::logging::LogRecord> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].log, "world\n");
    }
}
