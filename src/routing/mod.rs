//! Per-virtual-host routing.
//!
//! # Data Flow
//! ```text
//! RequestContext (method, path)
//!     → router.rs (route lookup in priority order)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: matched Route (handler chain) or no match
//!
//! Route Compilation (on first request for a host):
//!     [[route]] tables of the vhost file
//!     → Compile matchers
//!     → Sort by priority
//!     → Freeze as immutable Router inside the VirtualHost
//! ```
//!
//! # Design Decisions
//! - Routers are immutable once built; reloading replaces the whole VirtualHost
//! - No regex in hot path (prefix matching only)
//! - First match wins (ordered by priority)

pub mod matcher;
pub mod router;

pub use matcher::{AndMatcher, Matcher, MethodMatcher, PathPrefixMatcher};
pub use router::{Handler, Route, Router};
