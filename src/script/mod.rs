//! Embedded Lua runtime for handler scripts.
//!
//! # Data Flow
//! ```text
//! Dispatcher
//!     → ScriptHandle::bind (pool.rs: take a Lua state)
//!     → control.rs builds the request environment (`ctx` table)
//!     → ScriptHandle::run for each handler of the matched route
//!     → ScriptHandle::release (state collected and returned to the pool)
//! ```
//!
//! # Design Decisions
//! - A state serves one request at a time and never crosses an await
//! - Handlers run in a fresh environment table so globals set by one request
//!   are invisible to the next; library tables behind it are read-only
//! - Handlers loaded from disk carry precompiled bytecode, run in binary mode
//! - Release happens exactly once: explicitly, or from `Drop` on early exit

pub mod bind;
pub mod control;
pub mod pool;
pub mod value;

use std::sync::Arc;

use mlua::{ChunkMode, Lua, Table};
use thiserror::Error;

use crate::context::SharedContext;
use crate::routing::Handler;

pub use pool::{PoolStats, ScriptPool};

/// Script failures as seen by the dispatcher.
#[derive(Debug, Error)]
pub enum ScriptFailure {
    #[error("failed to prepare script state: {0}")]
    Setup(#[source] mlua::Error),

    #[error("handler {handler} failed: {source}")]
    Runtime {
        handler: String,
        #[source]
        source: mlua::Error,
    },

    #[error("script handle already released")]
    Released,
}

/// A pooled Lua state bound to one request.
pub struct ScriptHandle {
    pool: Arc<ScriptPool>,
    lua: Option<Lua>,
    env: Option<Table>,
}

impl ScriptHandle {
    /// Take a state from the pool and bind the control surface to `ctx`.
    pub fn bind(pool: Arc<ScriptPool>, ctx: SharedContext) -> Result<Self, ScriptFailure> {
        let lua = pool.acquire().map_err(ScriptFailure::Setup)?;
        let env = match control::build_env(&lua, ctx) {
            Ok(env) => env,
            Err(e) => {
                pool.release(lua);
                return Err(ScriptFailure::Setup(e));
            }
        };

        Ok(Self {
            pool,
            lua: Some(lua),
            env: Some(env),
        })
    }

    /// Run one handler in the request environment.
    pub fn run(&self, handler: &Handler) -> Result<(), ScriptFailure> {
        let (Some(lua), Some(env)) = (&self.lua, &self.env) else {
            return Err(ScriptFailure::Released);
        };

        let chunk = match &handler.bytecode {
            Some(bytecode) => lua.load(&bytecode[..]).set_mode(ChunkMode::Binary),
            None => lua.load(&*handler.source).set_mode(ChunkMode::Text),
        };
        chunk
            .set_name(&handler.name)
            .set_environment(env.clone())
            .exec()
            .map_err(|source| ScriptFailure::Runtime {
                handler: handler.name.clone(),
                source,
            })
    }

    /// Return the state to the pool.
    pub fn release(mut self) {
        self.release_state();
    }

    fn release_state(&mut self) {
        // The environment holds the closures that capture the request
        // context; drop it before the state is collected.
        self.env.take();
        if let Some(lua) = self.lua.take() {
            self.pool.release(lua);
        }
    }
}

impl Drop for ScriptHandle {
    fn drop(&mut self) {
        self.release_state();
    }
}
