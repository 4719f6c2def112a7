//! Per-request dispatch.
//!
//! # Data Flow
//! ```text
//! RequestContext
//!     → VirtualHostCache::require(host)
//!         NotFound → not_found target (same cache) → else 404
//!         error    → 500 with error text
//!     → geo attachment (region field → GeoLookup → user value `region`)
//!     → Router::match_request → handler chain (stops at eof)
//!     → access log
//!     → script state released
//! ```
//!
//! # Design Decisions
//! - Nothing per-request escapes as an error: every failure becomes a status
//! - The script state is bound lazily and released by a guard, so it goes
//!   back to the pool on every path, including panics
//! - The context lock is never held across an await or a script run

use std::sync::{Arc, PoisonError};
use std::time::Instant;

use axum::http::StatusCode;

use crate::access_log::AccessLogger;
use crate::context::{self, FieldResolver, RequestContext, SharedContext, REGION_KEY};
use crate::geo::GeoLookup;
use crate::observability::metrics;
use crate::script::{ScriptFailure, ScriptHandle, ScriptPool};
use crate::vhost::{VirtualHost, VirtualHostCache};

/// Geo lookups are skipped for values shorter than this ("1.1.1.1").
const MIN_REGION_SOURCE_LEN: usize = 7;

const NOT_FOUND_BODY: &str = "not found";
const SCRIPT_ERROR_BODY: &str = "internal server error";

/// Owns the lazily bound script handle of one request.
struct RequestScope {
    pool: Arc<ScriptPool>,
    ctx: SharedContext,
    handle: Option<ScriptHandle>,
}

impl RequestScope {
    fn new(pool: Arc<ScriptPool>, ctx: SharedContext) -> Self {
        Self {
            pool,
            ctx,
            handle: None,
        }
    }

    fn handle(&mut self) -> Result<&ScriptHandle, ScriptFailure> {
        if self.handle.is_none() {
            let handle = ScriptHandle::bind(Arc::clone(&self.pool), Arc::clone(&self.ctx))?;
            self.handle = Some(handle);
        }
        self.handle.as_ref().ok_or(ScriptFailure::Released)
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.release();
    }
}

/// Runs requests through virtual host resolution, handlers and access logging.
pub struct Dispatcher {
    vhosts: Arc<VirtualHostCache>,
    scripts: Arc<ScriptPool>,
    access: Arc<AccessLogger>,
    geo: Option<Arc<dyn GeoLookup>>,
    not_found: Option<String>,
    region: Option<String>,
}

impl Dispatcher {
    pub fn new(vhosts: Arc<VirtualHostCache>, scripts: Arc<ScriptPool>, access: Arc<AccessLogger>) -> Self {
        Self {
            vhosts,
            scripts,
            access,
            geo: None,
            not_found: None,
            region: None,
        }
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Virtual host used when the request's host has none.
    pub fn with_not_found(mut self, host: impl Into<String>) -> Self {
        self.not_found = Some(host.into()).filter(|h: &String| !h.is_empty());
        self
    }

    /// Global field whose value feeds the geo lookup.
    pub fn with_region(mut self, field: impl Into<String>) -> Self {
        self.region = Some(field.into()).filter(|f: &String| !f.is_empty());
        self
    }

    pub fn vhosts(&self) -> &Arc<VirtualHostCache> {
        &self.vhosts
    }

    pub fn access_log(&self) -> &Arc<AccessLogger> {
        &self.access
    }

    pub fn scripts(&self) -> &Arc<ScriptPool> {
        &self.scripts
    }

    /// Dispatch one request and return the context holding its response.
    pub async fn dispatch(&self, ctx: RequestContext) -> RequestContext {
        let start = Instant::now();
        let host = ctx.host().to_string();
        let shared = ctx.into_shared();
        let mut scope = RequestScope::new(Arc::clone(&self.scripts), Arc::clone(&shared));

        let vhost = match self.vhosts.require(&host).await {
            Ok(vhost) => {
                self.attach_region(&vhost, &shared);
                self.run_router(&vhost, &mut scope);
                Some(vhost)
            }
            Err(e) if e.is_not_found() => {
                self.handle_not_found(&host, &mut scope).await;
                None
            }
            Err(e) => {
                tracing::error!(host = %host, error = %e, "Failed to load virtual host");
                context::lock(&shared)
                    .response_mut()
                    .text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                None
            }
        };

        {
            let ctx = context::lock(&shared);
            self.access.log(vhost.as_deref(), &ctx);
            metrics::record_request(&host, ctx.response().status.as_u16(), start);
        }

        scope.release();
        drop(scope);

        match Arc::try_unwrap(shared) {
            Ok(ctx) => ctx.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => {
                tracing::debug!(host = %host, "Context still referenced after release, cloning");
                context::lock(&shared).clone()
            }
        }
    }

    async fn handle_not_found(&self, host: &str, scope: &mut RequestScope) {
        let Some(target) = self.not_found.as_deref() else {
            tracing::debug!(host = %host, "No virtual host");
            respond_not_found(&scope.ctx);
            return;
        };

        match self.vhosts.require(target).await {
            Ok(vhost) => {
                tracing::debug!(host = %host, target = %target, "Using not-found virtual host");
                self.run_router(&vhost, scope);
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(host = %host, target = %target, "Not-found virtual host is missing");
                respond_not_found(&scope.ctx);
            }
            Err(e) => {
                tracing::error!(host = %host, target = %target, error = %e, "Failed to load not-found virtual host");
                context::lock(&scope.ctx)
                    .response_mut()
                    .text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        }
    }

    fn attach_region(&self, vhost: &VirtualHost, ctx: &SharedContext) {
        let Some(geo) = &self.geo else {
            return;
        };
        let field = vhost
            .region
            .as_deref()
            .filter(|f| !f.is_empty())
            .or(self.region.as_deref());
        let Some(field) = field else {
            return;
        };

        let source = FieldResolver::resolve(&context::lock(ctx), field)
            .to_text()
            .into_owned();
        if source.len() < MIN_REGION_SOURCE_LEN {
            return;
        }

        match geo.lookup(&source) {
            Ok(info) => context::lock(ctx).set_user_value(REGION_KEY, info),
            Err(e) => {
                tracing::warn!(host = %vhost.host, field = %field, source = %source, error = %e, "Geo lookup failed");
            }
        }
    }

    fn run_router(&self, vhost: &VirtualHost, scope: &mut RequestScope) {
        let route = vhost.router.match_request(&context::lock(&scope.ctx));
        let Some(route) = route else {
            tracing::debug!(host = %vhost.host, "No route matched");
            respond_not_found(&scope.ctx);
            return;
        };

        for handler in &route.handlers {
            if context::lock(&scope.ctx).is_eof() {
                break;
            }

            let result = scope.handle().and_then(|handle| handle.run(handler));
            if let Err(e) = result {
                tracing::error!(
                    host = %vhost.host,
                    route = %route.name,
                    handler = %handler.name,
                    error = %e,
                    "Handler failed"
                );
                metrics::record_script_error(&vhost.host);
                context::lock(&scope.ctx)
                    .response_mut()
                    .text(StatusCode::INTERNAL_SERVER_ERROR, SCRIPT_ERROR_BODY);
                return;
            }
        }
    }
}

fn respond_not_found(ctx: &SharedContext) {
    context::lock(ctx)
        .response_mut()
        .text(StatusCode::NOT_FOUND, NOT_FOUND_BODY);
}
