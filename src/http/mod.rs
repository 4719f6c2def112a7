//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper http1, Axum middleware, request ID)
//!     → request.rs (size limit, buffer body, multipart, build context)
//!     → dispatch (virtual host, handler chain, access log)
//!     → response.rs (context response → hyper response)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{into_context, RequestError, RequestIdMaker, X_REQUEST_ID};
pub use response::into_response;
pub use server::{BuildError, LocalAddr, Server, ServerBuilder};
