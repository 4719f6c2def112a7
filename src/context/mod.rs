//! Per-request state shared by the dispatcher and handler scripts.
//!
//! # Data Flow
//! ```text
//! hyper Request
//!     → http::request (buffer body, parse multipart)
//!     → RequestContext (request parts + response under construction)
//!     → SharedContext (Arc<Mutex<_>>) captured by the request's script closures
//!     → field.rs resolves derived attributes for scripts and access logs
//!     → http::response turns the response part back into a hyper Response
//! ```
//!
//! # Design Decisions
//! - One context per request, never shared across requests
//! - The termination flag is advisory: writes after it are logged, not rejected
//! - User values are tagged at bind time instead of inspected at read time

pub mod field;
pub mod user_value;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::http::{header, HeaderMap, Method, Request, StatusCode, Uri, Version};
use bytes::Bytes;
use chrono::{DateTime, Local};

pub use field::{FieldResolver, FieldValue};
pub use user_value::{UserValue, REGION_KEY};

/// A request context shared between the dispatcher and the script closures
/// bound to that one request.
pub type SharedContext = Arc<Mutex<RequestContext>>;

/// Lock a shared context, recovering the data if a script callback panicked
/// while holding the lock.
pub fn lock(ctx: &SharedContext) -> MutexGuard<'_, RequestContext> {
    ctx.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A file part of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq)]
pub struct FormFile {
    pub field: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// The response being built for a request.
#[derive(Debug, Clone)]
pub struct ResponseState {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }
}

impl ResponseState {
    /// Replace status and body with a plain-text message.
    pub fn text(&mut self, status: StatusCode, body: impl Into<Vec<u8>>) {
        self.status = status;
        self.body = body.into();
        self.headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
}

/// One in-flight request and the response under construction.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    received_at: DateTime<Local>,
    form_fields: Vec<(String, String)>,
    files: Vec<FormFile>,
    response: ResponseState,
    user_values: HashMap<String, UserValue>,
    eof: bool,
}

impl RequestContext {
    /// Build a context from a fully buffered request.
    pub fn new(request: Request<Bytes>, remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            remote_addr,
            local_addr,
            received_at: Local::now(),
            form_fields: Vec::new(),
            files: Vec::new(),
            response: ResponseState::default(),
            user_values: HashMap::new(),
            eof: false,
        }
    }

    /// Attach the parsed parts of a multipart body.
    pub fn with_form(mut self, fields: Vec<(String, String)>, files: Vec<FormFile>) -> Self {
        self.form_fields = fields;
        self.files = files;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    /// Text fields of a multipart body.
    pub fn form_fields(&self) -> &[(String, String)] {
        &self.form_fields
    }

    /// File parts of a multipart body.
    pub fn files(&self) -> &[FormFile] {
        &self.files
    }

    /// The Host header, falling back to the URI authority.
    pub fn host(&self) -> &str {
        self.headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
            .unwrap_or("")
    }

    pub fn response(&self) -> &ResponseState {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseState {
        &mut self.response
    }

    /// Move the response out, leaving a default one behind.
    pub fn take_response(&mut self) -> ResponseState {
        std::mem::take(&mut self.response)
    }

    pub fn user_value(&self, key: &str) -> Option<&UserValue> {
        self.user_values.get(key)
    }

    pub fn set_user_value(&mut self, key: impl Into<String>, value: impl Into<UserValue>) {
        self.user_values.insert(key.into(), value.into());
    }

    pub fn remove_user_value(&mut self, key: &str) -> Option<UserValue> {
        self.user_values.remove(key)
    }

    /// Whether the termination flag has been set.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Wrap the context for sharing with script closures.
    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(host: &str) -> RequestContext {
        let request = Request::builder()
            .uri("/index?x=1")
            .header("host", host)
            .body(Bytes::new())
            .unwrap();
        RequestContext::new(request, "10.0.0.1:5000".parse().unwrap(), "10.0.0.2:80".parse().unwrap())
    }

    #[test]
    fn test_host_and_defaults() {
        let ctx = context("example.com");
        assert_eq!(ctx.host(), "example.com");
        assert_eq!(ctx.response().status, StatusCode::OK);
        assert!(!ctx.is_eof());
    }

    #[test]
    fn test_host_falls_back_to_authority() {
        let request = Request::builder()
            .uri("http://authority.test/path")
            .body(Bytes::new())
            .unwrap();
        let ctx = RequestContext::new(request, "127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap());
        assert_eq!(ctx.host(), "authority.test");
    }

    #[test]
    fn test_user_values_and_take_response() {
        let mut ctx = context("a");
        ctx.set_user_value("n", 7_i64);
        assert_eq!(ctx.user_value("n"), Some(&UserValue::Int(7)));

        ctx.response_mut().text(StatusCode::CREATED, "made");
        let response = ctx.take_response();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body, b"made");
        assert_eq!(ctx.response().status, StatusCode::OK);
    }
}
