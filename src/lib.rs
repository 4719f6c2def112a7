//! Scriptable HTTP gateway.
//!
//! Requests are routed by `Host` to a virtual host loaded from a router
//! file, matched against its routes and answered by a chain of Lua handlers
//! that read request fields and write the response through `ctx`.

pub mod access_log;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod geo;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod script;
pub mod vhost;

pub use config::schema::GatewayConfig;
pub use context::{FieldResolver, FieldValue, RequestContext};
pub use dispatch::Dispatcher;
pub use http::Server;
pub use lifecycle::{LifecycleState, Shutdown};
