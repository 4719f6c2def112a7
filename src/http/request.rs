//! Request intake.
//!
//! # Responsibilities
//! - Generate unique request IDs (UUID v4)
//! - Enforce the body size limit before dispatch
//! - Buffer the body and parse `multipart/form-data` parts
//! - Build the [`RequestContext`] handed to the dispatcher
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Declared Content-Length is checked before any body byte is read
//! - A malformed multipart body is logged and dispatched with the parts
//!   parsed so far; handlers still see the raw body

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use thiserror::Error;
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

use crate::context::{FormFile, RequestContext};

/// Header carrying the request ID.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Generates a UUID v4 for requests that arrive without an ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdMaker;

impl MakeRequestId for RequestIdMaker {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Errors that stop a request before it reaches the dispatcher.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request body too large")]
    TooLarge,

    #[error("failed to read request body: {0}")]
    Body(String),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = match self {
            RequestError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RequestError::Body(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Buffer `request` and build its context.
pub async fn into_context(
    request: Request<Body>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    max_body_size: usize,
) -> Result<RequestContext, RequestError> {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > max_body_size as u64) {
        return Err(RequestError::TooLarge);
    }

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, max_body_size)
        .await
        .map_err(|e| RequestError::Body(e.to_string()))?;

    let boundary = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok());

    let request = Request::from_parts(parts, body.clone());
    let ctx = RequestContext::new(request, remote_addr, local_addr);

    match boundary {
        Some(boundary) => {
            let (fields, files) = parse_multipart(body, boundary).await;
            Ok(ctx.with_form(fields, files))
        }
        None => Ok(ctx),
    }
}

async fn parse_multipart(body: Bytes, boundary: String) -> (Vec<(String, String)>, Vec<FormFile>) {
    let stream = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Vec::new();
    let mut files = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed multipart body");
                break;
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|m| m.to_string());

        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(field = %name, error = %e, "Malformed multipart field");
                break;
            }
        };

        if filename.is_some() {
            files.push(FormFile {
                field: name,
                filename,
                content_type,
                data,
            });
        } else {
            fields.push((name, String::from_utf8_lossy(&data).into_owned()));
        }
    }

    (fields, files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.2:5555".parse().unwrap(), "10.0.0.1:8080".parse().unwrap())
    }

    #[tokio::test]
    async fn test_plain_body() {
        let (remote, local) = addrs();
        let request = Request::builder()
            .method("POST")
            .uri("/submit")
            .header("host", "a.test")
            .body(Body::from("payload"))
            .unwrap();

        let ctx = into_context(request, remote, local, 1024).await.unwrap();
        assert_eq!(ctx.body().as_ref(), b"payload");
        assert_eq!(ctx.host(), "a.test");
        assert_eq!(ctx.remote_addr(), remote);
        assert!(ctx.files().is_empty());
    }

    #[tokio::test]
    async fn test_body_limit() {
        let (remote, local) = addrs();
        let request = Request::builder()
            .header("content-length", "10")
            .body(Body::from("0123456789"))
            .unwrap();
        assert!(matches!(
            into_context(request, remote, local, 4).await,
            Err(RequestError::TooLarge)
        ));

        let request = Request::builder().body(Body::from("0123456789")).unwrap();
        let err = into_context(request, remote, local, 4).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_multipart_body() {
        let (remote, local) = addrs();
        let body = "--XyZ\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\r\n\
            report\r\n\
            --XyZ\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file-data\r\n\
            --XyZ--\r\n";
        let request = Request::builder()
            .method("POST")
            .header("content-type", "multipart/form-data; boundary=XyZ")
            .body(Body::from(body))
            .unwrap();

        let ctx = into_context(request, remote, local, 4096).await.unwrap();
        assert_eq!(ctx.form_fields(), &[("title".to_string(), "report".to_string())]);
        assert_eq!(ctx.files().len(), 1);
        let file = &ctx.files()[0];
        assert_eq!(file.field, "upload");
        assert_eq!(file.filename.as_deref(), Some("a.txt"));
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
        assert_eq!(file.data.as_ref(), b"file-data");
    }

    #[tokio::test]
    async fn test_malformed_multipart_still_dispatches() {
        let (remote, local) = addrs();
        let request = Request::builder()
            .header("content-type", "multipart/form-data; boundary=XyZ")
            .body(Body::from("not multipart at all"))
            .unwrap();

        let ctx = into_context(request, remote, local, 4096).await.unwrap();
        assert!(ctx.files().is_empty());
        assert_eq!(ctx.body().as_ref(), b"not multipart at all");
    }

    #[test]
    fn test_request_id_maker() {
        let request = Request::builder().body(()).unwrap();
        let id = RequestIdMaker.make_request_id(&request).unwrap();
        let text = id.header_value().to_str().unwrap();
        assert!(Uuid::parse_str(text).is_ok());
    }
}
