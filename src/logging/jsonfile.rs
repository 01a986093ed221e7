//! `json-file` log format and rotation

use crate::container::options::LogConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One log line as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// The line, newline included when the source had one
    pub log: String,
    /// `stdout` or `stderr`
    pub stream: String,
    pub time: DateTime<Utc>,
}

/// Path of the `n`th rotated file; 0 is the live file
pub fn rotated_path(path: &Path, n: u32) -> PathBuf {
    if n == 0 {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.{}", path.display(), n))
    }
}

/// Appends records to a container log, rotating by size
pub struct JsonFileWriter {
    path: PathBuf,
    file: File,
    size: u64,
    config: LogConfig,
}

impl JsonFileWriter {
    pub fn open(path: &Path, config: LogConfig) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            config,
        })
    }

    /// Encode and append one record, stamped now
    pub fn write(&mut self, stream: &str, line: &[u8]) -> Result<()> {
        let record = LogRecord {
            log: String::from_utf8_lossy(line).into_owned(),
            stream: stream.to_string(),
            time: Utc::now(),
        };
        let mut buf = serde_json::to_vec(&record)?;
        buf.push(b'\n');

        if let Some(max) = self.config.max_size {
            if self.size > 0 && self.size + buf.len() as u64 > max {
                self.rotate()?;
            }
        }
        // One write call per record keeps lines whole.
        self.file.write_all(&buf)?;
        self.size += buf.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if self.config.max_file <= 1 {
            self.file.set_len(0)?;
            self.size = 0;
            return Ok(());
        }
        for n in (1..self.config.max_file).rev() {
            let from = rotated_path(&self.path, n - 1);
            if from.exists() {
                std::fs::rename(&from, rotated_path(&self.path, n))?;
            }
        }
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::options::LogDriver;

    fn read_records(path: &Path) -> Vec<LogRecord> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_records_are_single_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        let mut w = JsonFileWriter::open(&path, LogConfig::default()).unwrap();
        w.write("stdout", b"hello\n").unwrap();
        w.write("stderr", b"with \"quotes\"\n").unwrap();
        let recs = read_records(&path);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].log, "hello\n");
        assert_eq!(recs[1].stream, "stderr");
    }

    #[test]
    fn test_rotation_keeps_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        let config = LogConfig {
            driver: LogDriver::JsonFile,
            max_size: Some(100),
            max_file: 3,
        };
        let mut w = JsonFileWriter::open(&path, config).unwrap();
        for i in 0..10 {
            w.write("stdout", format!("line {}\n", i).as_bytes()).unwrap();
        }
        assert!(path.exists());
        assert!(rotated_path(&path, 1).exists());
        assert!(rotated_path(&path, 2).exists());
        assert!(!rotated_path(&path, 3).exists());
        let last = read_records(&path);
        assert_eq!(last.last().unwrap().log, "line 9\n");
    }

    #[test]
    fn test_single_file_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        let config = LogConfig {
            driver: LogDriver::JsonFile,
            max_size: Some(100),
            max_file: 1,
        };
        let mut w = JsonFileWriter::open(&path, config).unwrap();
        for i in 0..10 {
            w.write("stdout", format!("line {}\n", i).as_bytes()).unwrap();
        }
        assert!(!rotated_path(&path, 1).exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 100);
    }
}
