//! Filesystem router loader.
//!
//! Layout:
//! ```text
//! <router_dir>/<host>.toml    one file per virtual host
//! <handler_dir>/<name>.lua    handler scripts referenced by routes
//! ```
//!
//! A host without a file is `NotFound`. Every other failure (unreadable file,
//! bad TOML, unknown method, missing or non-compiling handler) is reported as
//! its own variant so the dispatcher can tell "no such host" from "broken host".

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::Method;
use mlua::Lua;
use serde::Deserialize;
use thiserror::Error;

use crate::access_log::{open_sink, AccessFormat};
use crate::config::{AccessEncode, OutputConfig};
use crate::routing::{AndMatcher, Handler, Matcher, MethodMatcher, PathPrefixMatcher, Route, Router};
use crate::vhost::cache::HandlerCache;
use crate::vhost::VirtualHost;

/// Errors that can occur while loading a virtual host.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("virtual host not found: {0}")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid virtual host {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("failed to compile handler {name}: {message}")]
    Handler { name: String, message: String },

    #[error("router load task failed: {0}")]
    Task(String),
}

impl LoadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadError::NotFound(_))
    }
}

/// Produces a virtual host for a host name.
pub trait RouterLoader: Send + Sync {
    fn load(&self, host: &str) -> Result<VirtualHost, LoadError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VhostFile {
    region: Option<String>,
    #[serde(default = "default_true")]
    access_log: bool,
    access_format: Option<String>,
    output: Option<OutputConfig>,
    #[serde(default, rename = "route")]
    routes: Vec<RouteFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteFile {
    name: Option<String>,
    #[serde(default = "default_path")]
    path: String,
    method: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    handlers: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_path() -> String {
    "/".to_string()
}

/// Names used as file stems must stay inside their directory.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}

/// Loads virtual hosts from TOML files and handlers from Lua files.
pub struct FsRouterLoader {
    router_dir: PathBuf,
    handler_dir: PathBuf,
    encode: AccessEncode,
    handlers: Arc<HandlerCache>,
    // Compiles handlers to bytecode at load time so broken scripts fail the
    // host load instead of every request. Nothing is executed in this state.
    compiler: Mutex<Lua>,
}

impl FsRouterLoader {
    pub fn new(router_dir: impl Into<PathBuf>, handler_dir: impl Into<PathBuf>) -> Self {
        Self {
            router_dir: router_dir.into(),
            handler_dir: handler_dir.into(),
            encode: AccessEncode::default(),
            handlers: Arc::new(HandlerCache::new()),
            compiler: Mutex::new(Lua::new()),
        }
    }

    /// Encoding used for per-host access formats.
    pub fn with_encode(mut self, encode: AccessEncode) -> Self {
        self.encode = encode;
        self
    }

    /// The handler cache, so callers can clear it on reload.
    pub fn handler_cache(&self) -> Arc<HandlerCache> {
        Arc::clone(&self.handlers)
    }

    pub fn router_dir(&self) -> &Path {
        &self.router_dir
    }

    pub fn handler_dir(&self) -> &Path {
        &self.handler_dir
    }

    fn load_handler(&self, name: &str) -> Result<Handler, LoadError> {
        if !is_safe_name(name) {
            return Err(LoadError::Handler {
                name: name.to_string(),
                message: "invalid handler name".to_string(),
            });
        }

        let path = self.handler_dir.join(format!("{name}.lua"));
        let source = std::fs::read_to_string(&path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;

        let bytecode = {
            let lua = self.compiler.lock().unwrap_or_else(PoisonError::into_inner);
            let function = lua
                .load(source.as_str())
                .set_name(name)
                .into_function()
                .map_err(|e| LoadError::Handler {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;
            function.dump(false)
        };

        tracing::debug!(handler = %name, path = %path.display(), bytes = bytecode.len(), "Handler compiled");
        Ok(Handler::new(name, source).with_bytecode(bytecode))
    }

    fn build_route(&self, host: &str, index: usize, file: RouteFile, path: &Path) -> Result<Route, LoadError> {
        let mut matchers: Vec<Box<dyn Matcher>> = vec![Box::new(PathPrefixMatcher::new(file.path))];
        if let Some(method) = file.method.filter(|m| !m.is_empty()) {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
                LoadError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("invalid method {method:?}"),
                }
            })?;
            matchers.push(Box::new(MethodMatcher::new(method)));
        }

        let handlers = file
            .handlers
            .iter()
            .map(|name| self.handlers.get_or_load(name, |name| self.load_handler(name)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Route {
            name: file.name.unwrap_or_else(|| format!("{host}#{index}")),
            matcher: Box::new(AndMatcher::new(matchers)),
            priority: file.priority,
            handlers,
        })
    }
}

impl RouterLoader for FsRouterLoader {
    fn load(&self, host: &str) -> Result<VirtualHost, LoadError> {
        if !is_safe_name(host) {
            return Err(LoadError::NotFound(host.to_string()));
        }

        let path = self.router_dir.join(format!("{host}.toml"));
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(host.to_string()));
            }
            Err(source) => return Err(LoadError::Io { path, source }),
        };

        let file: VhostFile = toml::from_str(&text).map_err(|source| LoadError::Parse {
            path: path.clone(),
            source,
        })?;

        let routes = file
            .routes
            .into_iter()
            .enumerate()
            .map(|(index, route)| self.build_route(host, index, route, &path))
            .collect::<Result<Vec<_>, _>>()?;

        let access_format = file
            .access_format
            .filter(|f| !f.is_empty())
            .map(|f| AccessFormat::compile(&f, self.encode))
            .transpose()
            .map_err(|e| LoadError::Invalid {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .map(Arc::new);

        let output = file
            .output
            .as_ref()
            .map(open_sink)
            .transpose()
            .map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })?;

        let mut vhost = VirtualHost::new(host, Router::new(routes));
        vhost.region = file.region.filter(|r| !r.is_empty());
        vhost.access_log = file.access_log;
        vhost.access_format = access_format;
        vhost.output = output;
        Ok(vhost)
    }
}
