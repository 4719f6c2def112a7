//! Access-log output sinks.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::OutputConfig;

/// Destination for formatted access-log records.
pub trait OutputSink: Send + Sync {
    fn write(&self, record: &[u8]) -> io::Result<()>;
}

/// Appends one record per line to a file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Open `path` for appending, creating it and missing parent directories.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputSink for FileSink {
    fn write(&self, record: &[u8]) -> io::Result<()> {
        let mut line = Vec::with_capacity(record.len() + 1);
        line.extend_from_slice(record);
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)
    }
}

/// Emits records as `tracing` events with target `access`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn write(&self, record: &[u8]) -> io::Result<()> {
        tracing::info!(target: "access", "{}", String::from_utf8_lossy(record));
        Ok(())
    }
}

/// Build the sink described by an `output` table.
pub fn open_sink(config: &OutputConfig) -> io::Result<Arc<dyn OutputSink>> {
    match config {
        OutputConfig::File { path } => Ok(Arc::new(FileSink::open(path)?)),
        OutputConfig::Tracing => Ok(Arc::new(TracingSink)),
    }
}
