//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::Request;
use bytes::Bytes;

use scriptgate::access_log::{AccessFormat, AccessLogger, OutputSink};
use scriptgate::config::{AccessEncode, ScriptConfig};
use scriptgate::context::RequestContext;
use scriptgate::dispatch::Dispatcher;
use scriptgate::geo::{GeoError, GeoInfo, GeoLookup};
use scriptgate::routing::{Handler, PathPrefixMatcher, Route, Router};
use scriptgate::script::ScriptPool;
use scriptgate::vhost::{LoadError, RouterLoader, VirtualHost, VirtualHostCache};

/// Build a context for `host` and `path` with an optional body.
pub fn request(host: &str, path: &str, body: &'static str) -> RequestContext {
    request_from("10.0.0.9:40000", host, path, body)
}

pub fn request_from(remote: &str, host: &str, path: &str, body: &'static str) -> RequestContext {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("host", host)
        .header("user-agent", "scriptgate-test")
        .body(Bytes::from_static(body.as_bytes()))
        .unwrap();
    RequestContext::new(request, remote.parse().unwrap(), "10.0.0.1:8080".parse().unwrap())
}

/// One virtual host definition: a single `/` route running `handlers` in order.
#[derive(Clone, Default)]
pub struct HostSpec {
    pub handlers: Vec<&'static str>,
    pub region: Option<&'static str>,
    pub access_format: Option<&'static str>,
    pub output: Option<Arc<CollectSink>>,
}

impl HostSpec {
    pub fn scripts(handlers: &[&'static str]) -> Self {
        Self {
            handlers: handlers.to_vec(),
            ..Self::default()
        }
    }
}

/// Builds virtual hosts from in-memory specs and counts loads.
#[derive(Default)]
pub struct StaticLoader {
    hosts: HashMap<String, HostSpec>,
    loads: AtomicUsize,
    delay: Option<Duration>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: &str, spec: HostSpec) -> Self {
        self.hosts.insert(host.to_string(), spec);
        self
    }

    /// Sleep inside every load, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl RouterLoader for StaticLoader {
    fn load(&self, host: &str) -> Result<VirtualHost, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let spec = self
            .hosts
            .get(host)
            .ok_or_else(|| LoadError::NotFound(host.to_string()))?;

        let handlers = spec
            .handlers
            .iter()
            .enumerate()
            .map(|(i, source)| Arc::new(Handler::new(format!("h{i}"), *source)))
            .collect();
        let route = Route {
            name: "all".to_string(),
            matcher: Box::new(PathPrefixMatcher::new("/")),
            priority: 0,
            handlers,
        };

        let mut vhost = VirtualHost::new(host, Router::new(vec![route]));
        vhost.region = spec.region.map(str::to_string);
        vhost.access_format = spec
            .access_format
            .map(|f| Arc::new(AccessFormat::compile(f, AccessEncode::Text).unwrap()));
        vhost.output = spec
            .output
            .clone()
            .map(|sink| sink as Arc<dyn OutputSink>);
        Ok(vhost)
    }
}

/// Output sink that keeps records in memory.
#[derive(Default)]
pub struct CollectSink {
    records: Mutex<Vec<String>>,
}

impl CollectSink {
    pub fn records(&self) -> Vec<String> {
        self.records.lock().unwrap().clone()
    }
}

impl OutputSink for CollectSink {
    fn write(&self, record: &[u8]) -> std::io::Result<()> {
        self.records
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(record).into_owned());
        Ok(())
    }
}

/// Geo lookup backed by a fixed table, counting calls.
#[derive(Default)]
pub struct StaticGeo {
    table: HashMap<String, GeoInfo>,
    calls: AtomicUsize,
}

impl StaticGeo {
    pub fn with(mut self, ip: &str, info: GeoInfo) -> Self {
        self.table.insert(ip.to_string(), info);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GeoLookup for StaticGeo {
    fn lookup(&self, ip: &str) -> Result<GeoInfo, GeoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.table
            .get(ip)
            .cloned()
            .ok_or_else(|| GeoError::NotFound(ip.to_string()))
    }
}

/// Dispatcher over `loader` logging every request with `format` into `sink`.
pub fn dispatcher(loader: Arc<StaticLoader>, format: &str, sink: Arc<CollectSink>) -> Dispatcher {
    let access = AccessLogger::new(
        Some(AccessFormat::compile(format, AccessEncode::Text).unwrap()),
        Some(sink as Arc<dyn OutputSink>),
        None,
    );
    Dispatcher::new(
        Arc::new(VirtualHostCache::new(loader)),
        Arc::new(ScriptPool::new(&ScriptConfig::default())),
        Arc::new(access),
    )
}

pub fn body_text(ctx: &RequestContext) -> String {
    String::from_utf8_lossy(&ctx.response().body).into_owned()
}
