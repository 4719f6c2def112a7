//! HTTP server and lifecycle.
//!
//! # Responsibilities
//! - Build the dispatcher and its collaborators from config
//! - Create the Axum router and wire up middleware (trace, timeout, request ID)
//! - Bind the listener and run the accept loop (hyper http1 per connection)
//! - Idempotent, bounded shutdown
//!
//! # Design Decisions
//! - `start()` is synchronous so bind errors reach the caller directly
//! - Every request goes to one fallback handler; routing is per virtual host
//!   and happens inside the dispatcher
//! - `close()` drops the access log and clears caches before draining so
//!   nothing new is cached while connections finish
//! - A shutdown that misses its deadline leaves the server `Failed`; calling
//!   `close()` again resumes the drain

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Extension, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use notify::RecommendedWatcher;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::access_log::{AccessLogError, AccessLogger, OutputSink};
use crate::config::watcher::ReloadWatcher;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::geo::{GeoDatabase, GeoError, GeoLookup};
use crate::http::request::{into_context, RequestIdMaker};
use crate::http::response::into_response;
use crate::lifecycle::{LifecycleError, LifecycleState, Shutdown};
use crate::net::{ConnectionTracker, Listener};
use crate::script::ScriptPool;
use crate::vhost::{FsRouterLoader, HandlerCache, RouterLoader, VirtualHostCache};

/// Local address of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct LocalAddr(pub SocketAddr);

/// Application state injected into the handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub max_body_size: usize,
}

/// Errors while assembling a server from config.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    AccessLog(#[from] AccessLogError),

    #[error(transparent)]
    Geo(#[from] GeoError),
}

/// Per-connection protocol settings.
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    keepalive: bool,
    read_timeout: Option<Duration>,
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Assembles a [`Server`], optionally replacing the default collaborators.
pub struct ServerBuilder {
    config: GatewayConfig,
    loader: Option<Arc<dyn RouterLoader>>,
    geo: Option<Arc<dyn GeoLookup>>,
    output: Option<Arc<dyn OutputSink>>,
}

impl ServerBuilder {
    /// Use a custom router loader instead of the filesystem one.
    pub fn loader(mut self, loader: Arc<dyn RouterLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Use a custom geo lookup instead of `geo.database`.
    pub fn geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Use a custom global access-log sink instead of `access_log.output`.
    pub fn output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn build(self) -> Result<Server, BuildError> {
        let config = self.config;

        let (loader, handlers): (Arc<dyn RouterLoader>, Option<Arc<HandlerCache>>) = match self.loader {
            Some(loader) => (loader, None),
            None => {
                let fs = FsRouterLoader::new(&config.vhost.router_dir, &config.vhost.handler_dir)
                    .with_encode(config.access_log.encode);
                let handlers = fs.handler_cache();
                (Arc::new(fs) as Arc<dyn RouterLoader>, Some(handlers))
            }
        };

        let geo: Option<Arc<dyn GeoLookup>> = match self.geo {
            Some(geo) => Some(geo),
            None => match &config.geo.database {
                Some(path) => Some(Arc::new(GeoDatabase::open(Path::new(path))?) as Arc<dyn GeoLookup>),
                None => None,
            },
        };

        let mut access = AccessLogger::from_config(&config.access_log)?;
        if let Some(output) = self.output {
            access = access.with_output(output);
        }

        let mut dispatcher = Dispatcher::new(
            Arc::new(VirtualHostCache::new(loader)),
            Arc::new(ScriptPool::new(&config.script)),
            Arc::new(access),
        );
        if let Some(geo) = geo {
            dispatcher = dispatcher.with_geo(geo);
        }
        if let Some(host) = &config.vhost.not_found {
            dispatcher = dispatcher.with_not_found(host.clone());
        }
        if let Some(field) = &config.vhost.region {
            dispatcher = dispatcher.with_region(field.clone());
        }

        Ok(Server {
            config,
            dispatcher: Arc::new(dispatcher),
            handlers,
            state: Mutex::new(LifecycleState::Init),
            shutdown: Arc::new(Shutdown::new()),
            tracker: ConnectionTracker::new(),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }
}

/// The gateway server: owns the listener, the dispatcher and the lifecycle.
pub struct Server {
    config: GatewayConfig,
    dispatcher: Arc<Dispatcher>,
    handlers: Option<Arc<HandlerCache>>,
    state: Mutex<LifecycleState>,
    shutdown: Arc<Shutdown>,
    tracker: ConnectionTracker,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Server {
    pub fn builder(config: GatewayConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            loader: None,
            geo: None,
            output: None,
        }
    }

    /// Build a server with the default collaborators.
    pub fn new(config: GatewayConfig) -> Result<Self, BuildError> {
        Self::builder(config).build()
    }

    /// Bind, open the access log and spawn the accept loop.
    ///
    /// Must be called within a Tokio runtime. Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr, LifecycleError> {
        let mut state = lock(&self.state);
        if *state != LifecycleState::Init {
            return Err(LifecycleError::AlreadyStarted(*state));
        }

        let listener = match Listener::bind(&self.config.listener, Duration::from_secs(self.config.timeouts.idle_secs)) {
            Ok(listener) => listener,
            Err(e) => {
                *state = LifecycleState::Failed;
                return Err(e.into());
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                *state = LifecycleState::Failed;
                return Err(e.into());
            }
        };

        if let Err(e) = self.dispatcher.access_log().open() {
            *state = LifecycleState::Failed;
            return Err(e.into());
        }

        if self.config.vhost.watch {
            self.start_watcher();
        }

        let settings = ConnectionSettings {
            keepalive: self.config.listener.keepalive,
            read_timeout: secs(self.config.timeouts.read_secs),
        };
        let app = self.build_router();
        let task = tokio::spawn(accept_loop(
            listener,
            app,
            Arc::clone(&self.shutdown),
            self.tracker.clone(),
            settings,
        ));

        *lock(&self.accept_task) = Some(task);
        *lock(&self.local_addr) = Some(addr);
        *state = LifecycleState::Running;

        tracing::info!(
            name = %self.config.name,
            address = %addr,
            router_dir = %self.config.vhost.router_dir,
            "Gateway started"
        );
        Ok(addr)
    }

    /// Stop accepting, drain connections and release resources.
    ///
    /// Returns `Ok` right away when the server is already closed. A server
    /// left `Failed` by an earlier attempt drains again, so `close()` can be
    /// retried until the remaining connections are gone.
    pub async fn close(&self) -> Result<(), LifecycleError> {
        let mut task = {
            let mut state = lock(&self.state);
            match *state {
                LifecycleState::Closed => return Ok(()),
                LifecycleState::Init => {
                    *state = LifecycleState::Closed;
                    return Ok(());
                }
                LifecycleState::Running => match lock(&self.accept_task).take() {
                    Some(task) => Some(task),
                    // another caller is already closing
                    None => return Ok(()),
                },
                LifecycleState::Failed => {
                    tracing::info!(connections = self.tracker.active_count(), "Retrying gateway shutdown");
                    lock(&self.accept_task).take()
                }
            }
        };

        self.dispatcher.access_log().close();
        self.dispatcher.vhosts().clear();
        if let Some(handlers) = &self.handlers {
            handlers.clear();
        }
        lock(&self.watcher).take();
        self.shutdown.trigger();

        let result = match secs(self.config.timeouts.shutdown_grace_secs) {
            Some(grace) => match tokio::time::timeout(grace, self.drain(&mut task)).await {
                Ok(result) => result,
                Err(_) => Err(LifecycleError::Shutdown(format!(
                    "{} connections still open after {}s",
                    self.tracker.active_count(),
                    grace.as_secs()
                ))),
            },
            None => self.drain(&mut task).await,
        };

        let mut state = lock(&self.state);
        match &result {
            Ok(()) => {
                *state = LifecycleState::Closed;
                tracing::info!("Gateway closed");
            }
            Err(e) => {
                // keep an unfinished accept loop for the next attempt
                if let Some(task) = task {
                    *lock(&self.accept_task) = Some(task);
                }
                *state = LifecycleState::Failed;
                tracing::error!(error = %e, "Gateway shutdown failed");
            }
        }
        result
    }

    /// Wait for the accept loop, then for every open connection.
    async fn drain(&self, task: &mut Option<JoinHandle<()>>) -> Result<(), LifecycleError> {
        if let Some(handle) = task.as_mut() {
            let joined = handle.await;
            *task = None;
            joined.map_err(|e| LifecycleError::Shutdown(format!("accept loop failed: {e}")))?;
        }
        self.tracker.wait_idle().await;
        Ok(())
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        self.shutdown.wait().await;
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Open connections right now.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(&self) -> Router {
        let state = AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            max_body_size: self.config.security.max_body_size,
        };

        let mut router = Router::new().fallback(gateway_handler).with_state(state);
        if let Some(timeout) = secs(self.config.timeouts.request_secs) {
            router = router.layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout));
        }
        router
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(RequestIdMaker))
    }

    fn start_watcher(&self) {
        let router_dir = Path::new(&self.config.vhost.router_dir);
        let handler_dir = Path::new(&self.config.vhost.handler_dir);
        let (watcher, mut events) = ReloadWatcher::new(&[router_dir, handler_dir]);

        match watcher.run() {
            Ok(watcher) => *lock(&self.watcher) = Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "Router watcher not started");
                return;
            }
        }

        let vhosts = Arc::clone(self.dispatcher.vhosts());
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            // ends when the watcher (and its sender) is dropped by close()
            while let Some(event) = events.recv().await {
                vhosts.clear();
                if let Some(handlers) = &handlers {
                    handlers.clear();
                }
                tracing::info!(paths = ?event.paths, "Router files changed, caches cleared");
            }
        });
    }
}

/// Single entry point for every request.
async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(LocalAddr(local)): Extension<LocalAddr>,
    request: Request<Body>,
) -> Response {
    let ctx = match into_context(request, peer, local, state.max_body_size).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::debug!(peer_addr = %peer, error = %e, "Rejected request");
            return e.into_response();
        }
    };

    let ctx = state.dispatcher.dispatch(ctx).await;
    into_response(ctx)
}

async fn accept_loop(
    listener: Listener,
    app: Router,
    shutdown: Arc<Shutdown>,
    tracker: ConnectionTracker,
    settings: ConnectionSettings,
) {
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "Listener has no local address");
            return;
        }
    };

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let guard = tracker.track();
        let app = app.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let _permit = permit;
            tracing::trace!(connection_id = %guard.id(), peer_addr = %peer, "Serving connection");
            serve_connection(stream, peer, local_addr, app, shutdown, settings).await;
            drop(guard);
        });
    }

    tracing::info!(address = %local_addr, "Accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    app: Router,
    shutdown: Arc<Shutdown>,
    settings: ConnectionSettings,
) {
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        request.extensions_mut().insert(LocalAddr(local));
        app.clone().oneshot(request)
    });

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder.keep_alive(settings.keepalive).timer(TokioTimer::new());
    if let Some(timeout) = settings.read_timeout {
        builder.header_read_timeout(timeout);
    }

    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.wait() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(peer_addr = %peer, error = %e, "Connection ended with error");
    }
}
