//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → handed to Server::builder
//!
//! While running:
//!     watcher.rs detects changes under router_dir / handler_dir
//!     → virtual host and handler caches are cleared
//!     → next request reloads from disk
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - Router files are not config: they are cached and reloaded on demand
//! - All fields have defaults to allow minimal configs

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AccessEncode, AccessLogConfig, GatewayConfig, GeoConfig, ListenerConfig, ObservabilityConfig,
    OutputConfig, ScriptConfig, SecurityConfig, TimeoutConfig, VhostConfig,
};
