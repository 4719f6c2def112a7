//! The request control surface exposed to handler scripts as `ctx`.
//!
//! Every function captures the request's [`SharedContext`]. Arguments are
//! validated before anything is mutated, so a failing call leaves the
//! request untouched. The context lock is only held inside a single call.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use mlua::{Error as LuaError, IntoLua, Lua, LuaSerdeExt, Result as LuaResult, Table, Value, Variadic};

use crate::context::{self, FieldResolver, RequestContext, SharedContext};
use crate::script::bind::LuaFormFiles;
use crate::script::pool::SANDBOX_KEY;
use crate::script::value::{describe, user_value_from_lua};

fn runtime(msg: impl Into<String>) -> LuaError {
    LuaError::RuntimeError(msg.into())
}

fn concat(parts: &Variadic<mlua::String>) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts.iter() {
        out.extend_from_slice(&part.as_bytes());
    }
    out
}

fn warn_after_eof(ctx: &RequestContext, op: &str) {
    if ctx.is_eof() {
        tracing::warn!(host = %ctx.host(), op, "Response modified after eof");
    }
}

/// Validate name/value pairs before any of them is applied.
fn header_pairs(parts: &Variadic<mlua::String>) -> LuaResult<Vec<(HeaderName, HeaderValue)>> {
    if parts.len() % 2 != 0 {
        return Err(runtime("expected name/value pairs, got an odd number of arguments"));
    }

    parts
        .chunks(2)
        .map(|pair| {
            let name = HeaderName::from_bytes(&pair[0].as_bytes())
                .map_err(|_| runtime(format!("invalid header name {:?}", pair[0].to_string_lossy().to_string())))?;
            let value = HeaderValue::from_bytes(&pair[1].as_bytes())
                .map_err(|_| runtime(format!("invalid value for header {name}")))?;
            Ok((name, value))
        })
        .collect()
}

fn apply_headers(headers: &mut HeaderMap, pairs: Vec<(HeaderName, HeaderValue)>) {
    for (name, value) in pairs {
        headers.insert(name, value);
    }
}

/// Build the per-request environment: a table whose `ctx` entry holds the
/// control surface and whose missing globals fall through to the state's
/// read-only sandbox. Neither metatable is visible to scripts.
pub fn build_env(lua: &Lua, ctx: SharedContext) -> LuaResult<Table> {
    let surface = lua.create_table()?;
    register(lua, &surface, &ctx)?;

    let meta = lua.create_table()?;
    let c = ctx.clone();
    meta.set(
        "__index",
        lua.create_function(move |lua, (_, key): (Table, Value)| match key {
            Value::String(key) => {
                let key = key.to_string_lossy().to_string();
                FieldResolver::resolve(&context::lock(&c), &key).into_lua(lua)
            }
            _ => Ok(Value::Nil),
        })?,
    )?;
    meta.set(
        "__newindex",
        lua.create_function(|_, (_, key): (Table, Value)| -> LuaResult<()> {
            Err(runtime(format!("ctx is read-only, use ctx.set({})", describe(&key))))
        })?,
    )?;
    meta.set("__metatable", false)?;
    surface.set_metatable(Some(meta));

    let env = lua.create_table()?;
    env.set("ctx", surface)?;
    env.set("_G", env.clone())?;
    let env_meta = lua.create_table()?;
    env_meta.set("__index", lua.named_registry_value::<Table>(SANDBOX_KEY)?)?;
    env_meta.set("__metatable", false)?;
    env.set_metatable(Some(env_meta));
    Ok(env)
}

fn register(lua: &Lua, surface: &Table, ctx: &SharedContext) -> LuaResult<()> {
    let c = ctx.clone();
    surface.set(
        "say",
        lua.create_function(move |_, parts: Variadic<mlua::String>| {
            if parts.is_empty() {
                return Ok(());
            }
            let body = concat(&parts);
            let mut ctx = context::lock(&c);
            warn_after_eof(&ctx, "say");
            ctx.response_mut().body = body;
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "append",
        lua.create_function(move |_, parts: Variadic<mlua::String>| {
            if parts.is_empty() {
                return Ok(());
            }
            let body = concat(&parts);
            let mut ctx = context::lock(&c);
            warn_after_eof(&ctx, "append");
            ctx.response_mut().body.extend_from_slice(&body);
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "say_json",
        lua.create_function(move |_, value: Value| {
            let encoded = serde_json::to_vec(&value);
            let mut ctx = context::lock(&c);
            warn_after_eof(&ctx, "say_json");
            match encoded {
                Ok(body) => {
                    let response = ctx.response_mut();
                    response.body = body;
                    response.headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "say_json could not encode value");
                    ctx.response_mut()
                        .text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                }
            }
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "exit",
        lua.create_function(move |_, code: i64| {
            let status = u16::try_from(code)
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| runtime(format!("invalid status code {code}")))?;
            let mut ctx = context::lock(&c);
            ctx.response_mut().status = status;
            ctx.set_eof();
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "eof",
        lua.create_function(move |_, ()| {
            context::lock(&c).set_eof();
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "redirect",
        lua.create_function(move |_, (location, code): (mlua::String, Option<i64>)| {
            let code = code.unwrap_or(302);
            let status = u16::try_from(code)
                .ok()
                .filter(|code| (300..=399).contains(code))
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| runtime(format!("invalid redirect code {code}")))?;
            let location = HeaderValue::from_bytes(&location.as_bytes())
                .map_err(|_| runtime("invalid redirect location"))?;

            let mut ctx = context::lock(&c);
            warn_after_eof(&ctx, "redirect");
            let response = ctx.response_mut();
            response.status = status;
            response.headers.insert(header::LOCATION, location);
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "set_request_header",
        lua.create_function(move |_, parts: Variadic<mlua::String>| {
            let pairs = header_pairs(&parts)?;
            if !pairs.is_empty() {
                apply_headers(context::lock(&c).headers_mut(), pairs);
            }
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "set_response_header",
        lua.create_function(move |_, parts: Variadic<mlua::String>| {
            let pairs = header_pairs(&parts)?;
            if !pairs.is_empty() {
                apply_headers(&mut context::lock(&c).response_mut().headers, pairs);
            }
            Ok(())
        })?,
    )?;

    surface.set(
        "raise",
        lua.create_function(|_, values: Variadic<Value>| -> LuaResult<()> {
            if values.is_empty() {
                return Err(runtime("invalid"));
            }
            let message = values.iter().map(describe).collect::<Vec<_>>().join(" ");
            Err(runtime(message))
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "bind_body",
        lua.create_function(move |lua, kind: String| match kind.as_str() {
            "json" => {
                let body = context::lock(&c).body().clone();
                let value: serde_json::Value =
                    serde_json::from_slice(&body).map_err(|_| runtime("invalid json body"))?;
                lua.to_value(&value)
            }
            "file" => LuaFormFiles::new(context::lock(&c).files()).into_lua(lua),
            _ => Err(runtime("invalid bind type")),
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "var",
        lua.create_function(move |lua, key: String| {
            FieldResolver::resolve(&context::lock(&c), &key).into_lua(lua)
        })?,
    )?;

    let c = ctx.clone();
    surface.set(
        "set",
        lua.create_function(move |lua, (key, value): (String, Value)| {
            let value = user_value_from_lua(lua, value)?;
            let mut ctx = context::lock(&c);
            match value {
                Some(value) => ctx.set_user_value(key, value),
                None => {
                    ctx.remove_user_value(&key);
                }
            }
            Ok(())
        })?,
    )?;

    Ok(())
}
