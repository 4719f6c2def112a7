//! Conversions between request values and Lua values.

use mlua::{IntoLua, Lua, LuaSerdeExt, Result as LuaResult, Value};

use crate::context::{FieldValue, UserValue};

impl IntoLua for FieldValue {
    fn into_lua(self, lua: &Lua) -> LuaResult<Value> {
        match self {
            FieldValue::Null => Ok(Value::Nil),
            FieldValue::Str(s) => lua.create_string(&s).map(Value::String),
            FieldValue::Bytes(b) => lua.create_string(&b[..]).map(Value::String),
            FieldValue::Int(i) => Ok(Value::Integer(i)),
            FieldValue::Json(v) => lua.to_value(&v),
        }
    }
}

/// Convert a script value for `ctx.set`. `nil` means "unset".
pub fn user_value_from_lua(lua: &Lua, value: Value) -> LuaResult<Option<UserValue>> {
    let value = match value {
        Value::Nil => return Ok(None),
        Value::String(s) => match s.to_str() {
            Ok(text) => UserValue::Str(text.to_string()),
            Err(_) => UserValue::Bytes(bytes::Bytes::copy_from_slice(&s.as_bytes())),
        },
        Value::Integer(i) => UserValue::Int(i),
        other => UserValue::Json(lua.from_value::<serde_json::Value>(other)?),
    };
    Ok(Some(value))
}

/// Text of a value as `raise` reports it.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => format!("<{}>", other.type_name()),
    }
}
