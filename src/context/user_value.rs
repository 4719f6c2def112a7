//! Values bound to a request by the gateway or by handler scripts.

use std::sync::Arc;

use bytes::Bytes;

use crate::geo::GeoInfo;

/// User value key under which the geo-IP result is attached.
pub const REGION_KEY: &str = "region";

/// A value bound to a request, tagged with its shape at bind time.
#[derive(Debug, Clone, PartialEq)]
pub enum UserValue {
    Str(String),
    Int(i64),
    Bytes(Bytes),
    /// A script-native value, passed back to scripts unchanged.
    Json(serde_json::Value),
    Region(Arc<GeoInfo>),
}

impl UserValue {
    /// The attached geo-IP result, if this value is one.
    pub fn as_region(&self) -> Option<&GeoInfo> {
        match self {
            UserValue::Region(info) => Some(info),
            _ => None,
        }
    }
}

impl From<String> for UserValue {
    fn from(value: String) -> Self {
        UserValue::Str(value)
    }
}

impl From<&str> for UserValue {
    fn from(value: &str) -> Self {
        UserValue::Str(value.to_string())
    }
}

impl From<i64> for UserValue {
    fn from(value: i64) -> Self {
        UserValue::Int(value)
    }
}

impl From<Bytes> for UserValue {
    fn from(value: Bytes) -> Self {
        UserValue::Bytes(value)
    }
}

impl From<serde_json::Value> for UserValue {
    fn from(value: serde_json::Value) -> Self {
        UserValue::Json(value)
    }
}

impl From<GeoInfo> for UserValue {
    fn from(value: GeoInfo) -> Self {
        UserValue::Region(Arc::new(value))
    }
}
