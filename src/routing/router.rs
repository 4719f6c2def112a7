//! Route lookup for one virtual host.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the matching route for a request
//! - Return the matched route or an explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Ties keep declaration order

use std::sync::Arc;

use crate::context::RequestContext;
use crate::routing::matcher::Matcher;

/// A handler script. `bytecode`, when present, is the precompiled chunk
/// and is what runs; `source` is kept for diagnostics.
#[derive(Debug)]
pub struct Handler {
    pub name: String,
    pub source: Arc<str>,
    pub bytecode: Option<Arc<[u8]>>,
}

impl Handler {
    pub fn new(name: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            bytecode: None,
        }
    }

    pub fn with_bytecode(mut self, bytecode: Vec<u8>) -> Self {
        self.bytecode = Some(bytecode.into());
        self
    }
}

/// A route: conditions plus the handler chain run when they match.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub matcher: Box<dyn Matcher>,
    pub priority: i32,
    pub handlers: Vec<Arc<Handler>>,
}

/// The route table of one virtual host.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Build a router. Routes are ordered by priority, highest first.
    pub fn new(mut routes: Vec<Route>) -> Self {
        // sort_by is stable, so equal priorities keep declaration order
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { routes }
    }

    /// First route whose conditions match the request.
    pub fn match_request(&self, ctx: &RequestContext) -> Option<&Route> {
        self.routes.iter().find(|route| route.matcher.matches(ctx))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
