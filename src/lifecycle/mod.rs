//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (http::server):
//!     Bind listener → open access log → spawn accept loop → Running
//!
//! Shutdown (shutdown.rs):
//!     close() or signal → stop accepting → drain connections → Closed
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls Server::close
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline; missing it marks the server Failed, and a
//!   later close() drains again

pub mod shutdown;
pub mod signals;
pub mod state;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
pub use state::{LifecycleError, LifecycleState};
