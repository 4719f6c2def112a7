//! Route matching logic.
//!
//! # Responsibilities
//! - Match request method (exact, case-sensitive like the HTTP method token)
//! - Match path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is done by the virtual host cache, not here
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use axum::http::Method;

use crate::context::RequestContext;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, ctx: &RequestContext) -> bool;
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, ctx: &RequestContext) -> bool {
        ctx.uri().path().starts_with(&self.prefix)
    }
}

/// Matches the request method.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    method: Method,
}

impl MethodMatcher {
    pub fn new(method: Method) -> Self {
        Self { method }
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, ctx: &RequestContext) -> bool {
        *ctx.method() == self.method
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, ctx: &RequestContext) -> bool {
        self.matchers.iter().all(|m| m.matches(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use bytes::Bytes;

    fn context(method: &str, uri: &str) -> RequestContext {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .unwrap();
        RequestContext::new(request, "127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap())
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api");
        assert!(matcher.matches(&context("GET", "http://example.com/api/v1")));
        assert!(!matcher.matches(&context("GET", "http://example.com/images")));
        assert!(!matcher.matches(&context("GET", "/API")));
    }

    #[test]
    fn test_method_matcher() {
        let matcher = MethodMatcher::new(Method::POST);
        assert!(matcher.matches(&context("POST", "/")));
        assert!(!matcher.matches(&context("GET", "/")));
    }

    #[test]
    fn test_and_matcher() {
        let empty = AndMatcher::new(Vec::new());
        assert!(empty.matches(&context("DELETE", "/anything")));

        let both = AndMatcher::new(vec![
            Box::new(MethodMatcher::new(Method::GET)),
            Box::new(PathPrefixMatcher::new("/static")),
        ]);
        assert!(both.matches(&context("GET", "/static/app.js")));
        assert!(!both.matches(&context("POST", "/static/app.js")));
        assert!(!both.matches(&context("GET", "/api")));
    }
}
