//! Uniform accessor for derived request attributes.
//!
//! Keys are either one of a closed set of literal names (`host`, `method`,
//! `status`, ...) or a prefixed family (`arg_id`, `http_x_real_ip`,
//! `cookie_session`, `region_city`, `param_user`). Unknown and malformed keys
//! resolve to [`FieldValue::Null`]; resolution never mutates the context.

use std::borrow::Cow;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use url::form_urlencoded;

use crate::context::user_value::{UserValue, REGION_KEY};
use crate::context::RequestContext;

/// The result of resolving a field key.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Str(String),
    Bytes(Bytes),
    Int(i64),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Textual form; `Null` renders as an empty string.
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Null => Cow::Borrowed(""),
            FieldValue::Str(s) => Cow::Borrowed(s.as_str()),
            FieldValue::Bytes(b) => String::from_utf8_lossy(b),
            FieldValue::Int(i) => Cow::Owned(i.to_string()),
            FieldValue::Json(serde_json::Value::String(s)) => Cow::Borrowed(s.as_str()),
            FieldValue::Json(v) => Cow::Owned(v.to_string()),
        }
    }

    /// JSON form used by the JSON access-log encoder.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Json(v) => v.clone(),
            other => serde_json::Value::String(other.to_text().into_owned()),
        }
    }
}

impl From<&HeaderValue> for FieldValue {
    fn from(value: &HeaderValue) -> Self {
        match value.to_str() {
            Ok(s) => FieldValue::Str(s.to_string()),
            Err(_) => FieldValue::Bytes(Bytes::copy_from_slice(value.as_bytes())),
        }
    }
}

/// The closed set of literal field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Host,
    Scheme,
    Method,
    UserAgent,
    RemoteAddr,
    RemotePort,
    ServerAddr,
    ServerPort,
    Time,
    Uri,
    FullUri,
    Query,
    Referer,
    ContentLength,
    Size,
    ContentType,
    Status,
    Sent,
    RequestId,
    RegionRaw,
    HeaderRaw,
    CookieRaw,
    BodyRaw,
}

impl Field {
    fn parse(key: &str) -> Option<Self> {
        let field = match key {
            "host" => Field::Host,
            "scheme" => Field::Scheme,
            "method" => Field::Method,
            "ua" => Field::UserAgent,
            "remote_addr" => Field::RemoteAddr,
            "remote_port" => Field::RemotePort,
            "server_addr" => Field::ServerAddr,
            "server_port" => Field::ServerPort,
            "time" => Field::Time,
            "uri" => Field::Uri,
            "full_uri" => Field::FullUri,
            "query" => Field::Query,
            "referer" => Field::Referer,
            "content_length" => Field::ContentLength,
            "size" => Field::Size,
            "content_type" => Field::ContentType,
            "status" => Field::Status,
            "sent" => Field::Sent,
            "request_id" => Field::RequestId,
            "region_raw" => Field::RegionRaw,
            "header_raw" => Field::HeaderRaw,
            "cookie_raw" => Field::CookieRaw,
            "body_raw" => Field::BodyRaw,
            _ => return None,
        };
        Some(field)
    }

    fn resolve(self, ctx: &RequestContext) -> FieldValue {
        match self {
            Field::Host => FieldValue::Str(ctx.host().to_string()),
            Field::Scheme => FieldValue::Str(ctx.uri().scheme_str().unwrap_or("http").to_string()),
            Field::Method => FieldValue::Str(ctx.method().as_str().to_string()),
            Field::UserAgent => header_field(ctx.headers(), header::USER_AGENT),
            Field::RemoteAddr => FieldValue::Str(ctx.remote_addr().ip().to_string()),
            Field::RemotePort => FieldValue::Int(i64::from(ctx.remote_addr().port())),
            Field::ServerAddr => FieldValue::Str(ctx.local_addr().ip().to_string()),
            Field::ServerPort => FieldValue::Int(i64::from(ctx.local_addr().port())),
            Field::Time => FieldValue::Str(
                ctx.received_at().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            ),
            Field::Uri => FieldValue::Str(ctx.uri().path().to_string()),
            Field::FullUri => FieldValue::Str(ctx.uri().to_string()),
            Field::Query => FieldValue::Str(ctx.uri().query().unwrap_or("").to_string()),
            Field::Referer => header_field(ctx.headers(), header::REFERER),
            Field::ContentLength => FieldValue::Int(
                ctx.headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .unwrap_or(0),
            ),
            Field::Size => {
                let size = raw_headers(ctx.headers()).len() + ctx.uri().to_string().len();
                FieldValue::Int(size as i64)
            }
            Field::ContentType => header_field(ctx.headers(), header::CONTENT_TYPE),
            Field::Status => FieldValue::Int(i64::from(ctx.response().status.as_u16())),
            Field::Sent => FieldValue::Int(ctx.response().body.len() as i64),
            Field::RequestId => header_field(ctx.headers(), HeaderName::from_static("x-request-id")),
            Field::RegionRaw => ctx
                .user_value(REGION_KEY)
                .and_then(UserValue::as_region)
                .map(|info| FieldValue::Str(info.raw()))
                .unwrap_or(FieldValue::Null),
            Field::HeaderRaw => FieldValue::Bytes(Bytes::from(raw_headers(ctx.headers()))),
            Field::CookieRaw => header_field(ctx.headers(), header::COOKIE),
            Field::BodyRaw => FieldValue::Bytes(ctx.body().clone()),
        }
    }
}

type PrefixResolver = fn(&RequestContext, &str) -> FieldValue;

/// Prefix families, tried in order after the literal names.
const PREFIXES: &[(&str, PrefixResolver)] = &[
    ("arg_", query_arg),
    ("post_", post_arg),
    ("http_", request_header),
    ("cookie_", cookie),
    ("region_", region),
    ("param_", param),
];

/// Resolves field keys against a request context.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldResolver;

impl FieldResolver {
    /// Resolve `key`. Total: anything unrecognised is `Null`.
    pub fn resolve(ctx: &RequestContext, key: &str) -> FieldValue {
        if let Some(field) = Field::parse(key) {
            return field.resolve(ctx);
        }

        for (prefix, resolve) in PREFIXES {
            if let Some(name) = key.strip_prefix(prefix) {
                if name.is_empty() {
                    return FieldValue::Null;
                }
                return resolve(ctx, name);
            }
        }

        FieldValue::Null
    }
}

fn header_field(headers: &HeaderMap, name: HeaderName) -> FieldValue {
    headers.get(name).map(FieldValue::from).unwrap_or(FieldValue::Null)
}

fn raw_headers(headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn find_form_value(input: &[u8], name: &str) -> FieldValue {
    form_urlencoded::parse(input)
        .find(|(key, _)| key == name)
        .map(|(_, value)| FieldValue::Str(value.into_owned()))
        .unwrap_or(FieldValue::Null)
}

fn query_arg(ctx: &RequestContext, name: &str) -> FieldValue {
    match ctx.uri().query() {
        Some(query) => find_form_value(query.as_bytes(), name),
        None => FieldValue::Null,
    }
}

fn post_arg(ctx: &RequestContext, name: &str) -> FieldValue {
    let content_type = ctx
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/x-www-form-urlencoded") {
        return find_form_value(ctx.body(), name);
    }

    ctx.form_fields()
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| FieldValue::Str(value.clone()))
        .unwrap_or(FieldValue::Null)
}

fn request_header(ctx: &RequestContext, name: &str) -> FieldValue {
    let name = name.replace('_', "-");
    match HeaderName::from_bytes(name.as_bytes()) {
        Ok(name) => header_field(ctx.headers(), name),
        Err(_) => FieldValue::Null,
    }
}

fn cookie(ctx: &RequestContext, name: &str) -> FieldValue {
    ctx.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| FieldValue::Str(value.trim().trim_matches('"').to_string()))
        .unwrap_or(FieldValue::Null)
}

fn region(ctx: &RequestContext, name: &str) -> FieldValue {
    let Some(info) = ctx.user_value(REGION_KEY).and_then(UserValue::as_region) else {
        return FieldValue::Null;
    };

    match name {
        "city" => FieldValue::Str(info.city.clone()),
        "city_id" => FieldValue::Int(info.city_id),
        "province" => FieldValue::Str(info.province.clone()),
        "region" => FieldValue::Str(info.region.clone()),
        "isp" => FieldValue::Str(info.isp.clone()),
        _ => FieldValue::Null,
    }
}

fn param(ctx: &RequestContext, name: &str) -> FieldValue {
    match ctx.user_value(name) {
        Some(UserValue::Json(value)) => FieldValue::Json(value.clone()),
        Some(UserValue::Str(s)) => FieldValue::Str(s.clone()),
        Some(UserValue::Int(i)) => FieldValue::Int(*i),
        Some(UserValue::Bytes(b)) => FieldValue::Bytes(b.clone()),
        Some(UserValue::Region(info)) => FieldValue::Str(info.raw()),
        None => FieldValue::Null,
    }
}
