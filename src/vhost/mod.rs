//! Virtual hosts: per-host routers plus their access-log and geo overrides.
//!
//! # Data Flow
//! ```text
//! Host header
//!     → cache.rs (memoized, single flight per host)
//!     → loader.rs on miss (blocking pool: read <host>.toml, load handlers)
//!     → Arc<VirtualHost>, shared by every request for that host
//! ```
//!
//! # Design Decisions
//! - Entries are immutable; a reload replaces them wholesale after `clear()`
//! - Failed loads are never memoized so a fixed file is picked up next request
//! - Handler sources are cached separately and shared between hosts

pub mod cache;
pub mod loader;

use std::fmt;
use std::sync::Arc;

use crate::access_log::{AccessFormat, OutputSink};
use crate::routing::Router;

pub use cache::{HandlerCache, VirtualHostCache};
pub use loader::{FsRouterLoader, LoadError, RouterLoader};

/// A resolved virtual host.
pub struct VirtualHost {
    pub host: String,
    pub router: Router,
    /// Field whose value feeds the geo-IP lookup; overrides the global one when set.
    pub region: Option<String>,
    /// `false` disables access logging for this host.
    pub access_log: bool,
    pub access_format: Option<Arc<AccessFormat>>,
    pub output: Option<Arc<dyn OutputSink>>,
}

impl VirtualHost {
    pub fn new(host: impl Into<String>, router: Router) -> Self {
        Self {
            host: host.into(),
            router,
            region: None,
            access_log: true,
            access_format: None,
            output: None,
        }
    }
}

impl fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualHost")
            .field("host", &self.host)
            .field("routes", &self.router.routes().len())
            .field("region", &self.region)
            .field("access_log", &self.access_log)
            .field("access_format", &self.access_format)
            .field("output", &self.output.is_some())
            .finish()
    }
}
