//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (connection limits, bind address, network family)
//! - Check that access-log templates compile
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::access_log::AccessFormat;
use crate::config::schema::{GatewayConfig, OutputConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listener.network must be tcp, tcp4 or tcp6, got {0:?}")]
    Network(String),

    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),

    #[error("listener.bind_address {address} does not match network {network}")]
    AddressFamily { network: String, address: String },

    #[error("listener.max_connections must be greater than zero")]
    MaxConnections,

    #[error("vhost.{0} must not be empty")]
    EmptyDirectory(&'static str),

    #[error("vhost.not_found must not be empty when set")]
    EmptyNotFound,

    #[error("access_log.format is invalid: {0}")]
    AccessFormat(String),

    #[error("access_log output path must not be empty")]
    EmptyOutputPath,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    MetricsAddress(String),

    #[error("script.memory_limit_mb must be at most 1048576, got {0}")]
    ScriptMemory(usize),
}

/// Upper bound for `script.memory_limit_mb` (1 TiB per Lua state).
pub const MAX_SCRIPT_MEMORY_MB: usize = 1024 * 1024;

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    let network_ok = matches!(listener.network.as_str(), "tcp" | "tcp4" | "tcp6");
    if !network_ok {
        errors.push(ValidationError::Network(listener.network.clone()));
    }

    match listener.bind_address.parse::<SocketAddr>() {
        Ok(addr) if network_ok => {
            let family_ok = match listener.network.as_str() {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            };
            if !family_ok {
                errors.push(ValidationError::AddressFamily {
                    network: listener.network.clone(),
                    address: listener.bind_address.clone(),
                });
            }
        }
        Ok(_) => {}
        Err(_) => errors.push(ValidationError::BindAddress(listener.bind_address.clone())),
    }

    if listener.max_connections == 0 {
        errors.push(ValidationError::MaxConnections);
    }

    if config.vhost.router_dir.trim().is_empty() {
        errors.push(ValidationError::EmptyDirectory("router_dir"));
    }
    if config.vhost.handler_dir.trim().is_empty() {
        errors.push(ValidationError::EmptyDirectory("handler_dir"));
    }
    if matches!(config.vhost.not_found.as_deref(), Some(host) if host.trim().is_empty()) {
        errors.push(ValidationError::EmptyNotFound);
    }

    if let Some(format) = &config.access_log.format {
        if let Err(e) = AccessFormat::compile(format, config.access_log.encode) {
            errors.push(ValidationError::AccessFormat(e.to_string()));
        }
    }

    let empty_path = matches!(&config.access_log.path, Some(path) if path.trim().is_empty())
        || matches!(&config.access_log.output, Some(OutputConfig::File { path }) if path.trim().is_empty());
    if empty_path {
        errors.push(ValidationError::EmptyOutputPath);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if config.script.memory_limit_mb > MAX_SCRIPT_MEMORY_MB {
        errors.push(ValidationError::ScriptMemory(config.script.memory_limit_mb));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
