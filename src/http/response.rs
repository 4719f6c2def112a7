//! Response conversion.
//!
//! The dispatcher leaves the finished response inside the request context;
//! this turns it into the message hyper writes back. Content-Length is
//! computed by hyper from the buffered body.

use axum::body::Body;
use axum::response::Response;

use crate::context::RequestContext;

pub fn into_response(mut ctx: RequestContext) -> Response {
    let state = ctx.take_response();
    let mut response = Response::new(Body::from(state.body));
    *response.status_mut() = state.status;
    *response.headers_mut() = state.headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_into_response() {
        let request = Request::builder().body(Bytes::new()).unwrap();
        let mut ctx = RequestContext::new(request, "127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap());
        ctx.response_mut().text(StatusCode::IM_A_TEAPOT, "short and stout");
        ctx.response_mut()
            .headers
            .insert("x-extra", "1".parse().unwrap());

        let response = into_response(ctx);
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers()["x-extra"], "1");
        assert_eq!(response.headers()["content-type"], "text/plain; charset=utf-8");

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"short and stout");
    }
}
