//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server name used in log lines.
    pub name: String,

    /// Listener configuration (network, bind address, reuse-port).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Virtual host resolution (router/handler directories, fallbacks).
    pub vhost: VhostConfig,

    /// Global access log settings.
    pub access_log: AccessLogConfig,

    /// Geo-IP database settings.
    pub geo: GeoConfig,

    /// Embedded script runtime settings.
    pub script: ScriptConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Request limits.
    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Network family: `tcp`, `tcp4` or `tcp6`.
    pub network: String,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Bind with SO_REUSEPORT so several processes can share the port.
    pub reuseport: bool,

    /// Enable HTTP and TCP keep-alive on accepted connections.
    pub keepalive: bool,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Listen backlog passed to the socket.
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            reuseport: false,
            keepalive: true,
            max_connections: 10_000,
            backlog: 1024,
        }
    }
}

/// Timeout configuration. A value of 0 disables the timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to read a request head, in seconds.
    pub read_secs: u64,

    /// TCP keep-alive idle time for open connections, in seconds.
    pub idle_secs: u64,

    /// Total time for one request to be dispatched, in seconds.
    pub request_secs: u64,

    /// Time `close()` waits for in-flight connections to drain, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 10,
            idle_secs: 60,
            request_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Virtual host resolution settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VhostConfig {
    /// Directory holding one `<host>.toml` file per virtual host.
    pub router_dir: String,

    /// Directory holding `<name>.lua` handler scripts.
    pub handler_dir: String,

    /// Virtual host used when the request host has no router.
    pub not_found: Option<String>,

    /// Field whose value is looked up in the geo-IP database
    /// (e.g. `remote_addr` or `http_x_real_ip`).
    pub region: Option<String>,

    /// Clear the router and handler caches when files change on disk.
    pub watch: bool,
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            router_dir: "routers".to_string(),
            handler_dir: "handlers".to_string(),
            not_found: None,
            region: None,
            watch: false,
        }
    }
}

/// How an access-log record is encoded.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessEncode {
    /// The format template with fields substituted in place.
    #[default]
    Text,
    /// A JSON object keyed by the fields named in the template.
    Json,
}

/// Where formatted access-log records are written.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputConfig {
    /// Append records to a file, one per line.
    File { path: String },
    /// Emit records as `tracing` events with target `access`.
    Tracing,
}

/// Global access log configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Format template, e.g. `$remote_addr "$method $uri" $status $sent`.
    /// Access logging is disabled when unset.
    pub format: Option<String>,

    /// Record encoding.
    pub encode: AccessEncode,

    /// File that receives records when no output sink is configured.
    pub path: Option<String>,

    /// Output sink used instead of `path`.
    pub output: Option<OutputConfig>,
}

/// Geo-IP settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GeoConfig {
    /// JSON range table loaded at startup.
    pub database: Option<String>,
}

/// Embedded script runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Number of idle Lua states kept for reuse.
    pub pool_size: usize,

    /// Memory limit per Lua state in megabytes (0 = unlimited).
    pub memory_limit_mb: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            memory_limit_mb: 64,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) when RUST_LOG is unset.
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}
