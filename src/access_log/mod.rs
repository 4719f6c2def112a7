//! Access logging.
//!
//! # Data Flow
//! ```text
//! finished RequestContext
//!     → formatter: per-host override, else global (skip if none)
//!     → render record via FieldResolver
//!     → output: per-host sink, else global sink, else global file + "\n"
//! ```
//!
//! # Design Decisions
//! - Write failures are logged, never surfaced to the client
//! - The global file lives in an ArcSwap slot so `close()` can drop it while
//!   requests are still finishing

pub mod format;
pub mod sink;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use thiserror::Error;

use crate::config::AccessLogConfig;
use crate::context::RequestContext;
use crate::vhost::VirtualHost;

pub use format::{AccessFormat, FormatError};
pub use sink::{open_sink, FileSink, OutputSink, TracingSink};

#[derive(Debug, Error)]
pub enum AccessLogError {
    #[error("invalid access log format: {0}")]
    Format(#[from] FormatError),

    #[error("failed to open access log output: {0}")]
    Io(#[from] io::Error),
}

/// Global access-log settings plus the open log file.
#[derive(Default)]
pub struct AccessLogger {
    format: Option<Arc<AccessFormat>>,
    output: Option<Arc<dyn OutputSink>>,
    path: Option<PathBuf>,
    file: ArcSwapOption<FileSink>,
}

impl AccessLogger {
    pub fn new(
        format: Option<AccessFormat>,
        output: Option<Arc<dyn OutputSink>>,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            format: format.map(Arc::new),
            output,
            path,
            file: ArcSwapOption::empty(),
        }
    }

    /// Compile the global format and open the configured output sink.
    /// The `path` file is opened separately by [`AccessLogger::open`].
    pub fn from_config(config: &AccessLogConfig) -> Result<Self, AccessLogError> {
        let format = config
            .format
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(|f| AccessFormat::compile(f, config.encode))
            .transpose()?;
        let output = config.output.as_ref().map(open_sink).transpose()?;
        Ok(Self::new(format, output, config.path.as_ref().map(PathBuf::from)))
    }

    /// Replace the global output sink.
    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = Some(output);
        self
    }

    /// Open the global access-log file, if one is configured.
    pub fn open(&self) -> io::Result<()> {
        if let Some(path) = &self.path {
            let file = FileSink::open(path)?;
            tracing::info!(path = %path.display(), "Access log opened");
            self.file.store(Some(Arc::new(file)));
        }
        Ok(())
    }

    /// Drop the global access-log file. Later records without a sink are discarded.
    pub fn close(&self) {
        if self.file.swap(None).is_some() {
            tracing::debug!("Access log closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.load().is_some()
    }

    /// Write one record for a finished request. `vhost` is `None` when the
    /// request never resolved to a virtual host.
    pub fn log(&self, vhost: Option<&VirtualHost>, ctx: &RequestContext) {
        if vhost.is_some_and(|v| !v.access_log) {
            return;
        }

        let Some(format) = vhost
            .and_then(|v| v.access_format.as_ref())
            .or(self.format.as_ref())
        else {
            return;
        };

        let record = format.render(ctx);
        let output = vhost.and_then(|v| v.output.as_ref()).or(self.output.as_ref());

        let result = match output {
            Some(sink) => sink.write(&record),
            None => match self.file.load_full() {
                Some(file) => file.write(&record),
                None => Ok(()),
            },
        };

        if let Err(e) = result {
            tracing::warn!(host = %ctx.host(), error = %e, "Failed to write access log");
        }
    }
}
