//! Server lifecycle states and errors.

use std::fmt;

use thiserror::Error;

use crate::net::ListenerError;

/// `Init → Running → Closed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Running,
    Closed,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "init",
            LifecycleState::Running => "running",
            LifecycleState::Closed => "closed",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by `Server::start` and `Server::close`.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error("shutdown did not complete: {0}")]
    Shutdown(String),

    #[error("server already started (state: {0})")]
    AlreadyStarted(LifecycleState),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
