//! Pool of reusable Lua states.
//!
//! Creating a Lua state and registering the built-in modules costs far more
//! than running a typical handler, so states are kept in a bounded idle list
//! and handed to one request at a time.
//!
//! States are sandboxed. There is no `io`, `package` or `debug`, and `os` is
//! cut down to its clock functions. Library tables are only reachable from
//! scripts through read-only proxies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use mlua::{Error as LuaError, Function, Lua, LuaOptions, Result as LuaResult, StdLib, Table, Value};

use crate::config::ScriptConfig;
use crate::script::value::describe;

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub created: usize,
    pub acquired: usize,
    pub released: usize,
    pub idle: usize,
}

/// Bounded pool of idle Lua states.
pub struct ScriptPool {
    idle: Mutex<Vec<Lua>>,
    max_idle: usize,
    memory_limit: usize,
    created: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptPool {
    pub fn new(config: &ScriptConfig) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(config.pool_size)),
            max_idle: config.pool_size,
            memory_limit: config.memory_limit_mb.saturating_mul(1024 * 1024),
            created: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Take an idle state or create a new one.
    pub fn acquire(&self) -> LuaResult<Lua> {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let lua = match idle {
            Some(lua) => lua,
            None => {
                let lua = create_state(self.memory_limit)?;
                self.created.fetch_add(1, Ordering::Relaxed);
                lua
            }
        };
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(lua)
    }

    /// Return a state. Garbage from the finished request is collected first;
    /// states beyond the idle bound are dropped.
    pub fn release(&self, lua: Lua) {
        self.released.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = lua.gc_collect() {
            tracing::warn!(error = %e, "Dropping Lua state after failed collection");
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(lua);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            idle: self.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

/// Registry key of the table handler environments fall back to.
pub(crate) const SANDBOX_KEY: &str = "scriptgate.sandbox";

/// Base functions that reach the filesystem, compile code or bypass
/// metatables.
const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile", "load", "collectgarbage", "rawset", "print"];

const OS_FUNCTIONS: &[&str] = &["time", "clock", "date", "difftime"];

fn create_state(memory_limit: usize) -> LuaResult<Lua> {
    let libs = StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH | StdLib::OS;
    let lua = Lua::new_with(libs, LuaOptions::default())?;
    if memory_limit > 0 {
        lua.set_memory_limit(memory_limit)?;
    }
    register_log_module(&lua)?;
    install_sandbox(&lua)?;
    Ok(lua)
}

/// Strip unsafe globals and store the read-only view of what is left under
/// [`SANDBOX_KEY`].
fn install_sandbox(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(*name, Value::Nil)?;
    }

    let os: Table = globals.get("os")?;
    let clock = lua.create_table()?;
    for name in OS_FUNCTIONS {
        clock.set(*name, os.get::<Value>(*name)?)?;
    }
    globals.set("os", clock)?;

    // the string metatable would otherwise hand out the real `string` table
    lua.load("getmetatable('').__metatable = false")
        .set_name("=sandbox")
        .exec()?;

    let guard = lua.create_function(|_, (_, key): (Table, Value)| -> LuaResult<()> {
        Err(LuaError::RuntimeError(format!(
            "cannot modify read-only table (key {})",
            describe(&key)
        )))
    })?;

    let entries = globals
        .pairs::<Value, Value>()
        .collect::<LuaResult<Vec<_>>>()?;
    let sandbox = lua.create_table()?;
    for (name, value) in entries {
        if let Value::String(s) = &name {
            if *s == "_G" {
                continue;
            }
        }
        let value = match value {
            Value::Table(table) => Value::Table(read_only(lua, table, &guard)?),
            other => other,
        };
        sandbox.raw_set(name, value)?;
    }
    lua.set_named_registry_value(SANDBOX_KEY, sandbox)
}

/// Empty proxy reading through to `target`. Writes raise and the metatable
/// is hidden from `getmetatable`/`setmetatable`.
fn read_only(lua: &Lua, target: Table, guard: &Function) -> LuaResult<Table> {
    let meta = lua.create_table()?;
    meta.set("__index", target)?;
    meta.set("__newindex", guard.clone())?;
    meta.set("__metatable", false)?;

    let proxy = lua.create_table()?;
    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

/// `log.info(msg)` and friends, emitted with target `lua`.
fn register_log_module(lua: &Lua) -> LuaResult<()> {
    let log = lua.create_table()?;

    log.set(
        "debug",
        lua.create_function(|_, msg: String| {
            tracing::debug!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "info",
        lua.create_function(|_, msg: String| {
            tracing::info!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "warn",
        lua.create_function(|_, msg: String| {
            tracing::warn!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "error",
        lua.create_function(|_, msg: String| {
            tracing::error!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize) -> ScriptPool {
        ScriptPool::new(&ScriptConfig {
            pool_size: size,
            memory_limit_mb: 16,
        })
    }

    #[test]
    fn test_states_are_reused() {
        let pool = pool(2);
        let lua = pool.acquire().unwrap();
        pool.release(lua);
        let lua = pool.acquire().unwrap();
        pool.release(lua);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool = pool(1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.stats().created, 2);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_log_module_registered() {
        let pool = pool(1);
        let lua = pool.acquire().unwrap();
        lua.load("log.info('hello from lua')").exec().unwrap();
        lua.load("log.debug('x'); log.warn('y'); log.error('z')").exec().unwrap();
    }

    fn sandboxed(lua: &Lua, source: &str) -> LuaResult<()> {
        let env: Table = lua.named_registry_value(SANDBOX_KEY)?;
        lua.load(source).set_environment(env).exec()
    }

    #[test]
    fn test_unsafe_libraries_are_absent() {
        let pool = pool(1);
        let lua = pool.acquire().unwrap();
        sandboxed(
            &lua,
            r#"
            assert(io == nil)
            assert(os.exit == nil)
            assert(os.execute == nil)
            assert(os.getenv == nil)
            assert(os.remove == nil)
            assert(dofile == nil and loadfile == nil and load == nil)
            assert(require == nil and package == nil and debug == nil)
            assert(type(os.time()) == "number")
            assert(string.upper("ok") == "OK")
            assert(("ok"):rep(2) == "okok")
            "#,
        )
        .unwrap();
    }

    #[test]
    fn test_library_tables_are_read_only() {
        let pool = pool(1);
        let lua = pool.acquire().unwrap();

        assert!(sandboxed(&lua, "string.upper = nil").is_err());
        assert!(sandboxed(&lua, "table.extra = 1").is_err());
        assert!(sandboxed(&lua, "setmetatable(math, nil)").is_err());
        sandboxed(&lua, "assert(getmetatable(string) == false)").unwrap();
        sandboxed(&lua, "assert(getmetatable('') == false)").unwrap();
        sandboxed(&lua, "assert(string.upper('x') == 'X' and table.extra == nil)").unwrap();
    }

    #[test]
    fn test_memory_limit_saturates() {
        let pool = ScriptPool::new(&ScriptConfig {
            pool_size: 1,
            memory_limit_mb: usize::MAX,
        });
        assert_eq!(pool.memory_limit, usize::MAX);
        pool.release(pool.acquire().unwrap());
    }
}
