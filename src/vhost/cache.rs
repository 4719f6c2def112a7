//! Memoized virtual host and handler lookup.
//!
//! # Responsibilities
//! - Map exact host strings to loaded virtual hosts
//! - Single-flight loading: concurrent misses for one host share one load
//! - Keep loads off the async workers (blocking pool)
//!
//! # Design Decisions
//! - The DashMap shard lock only covers get-or-create of the per-host cell,
//!   never the load itself, so different hosts load in parallel
//! - A failed load removes its still-empty cell; the next request retries

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::observability::metrics;
use crate::routing::Handler;
use crate::vhost::loader::{LoadError, RouterLoader};
use crate::vhost::VirtualHost;

type Slot = Arc<OnceCell<Arc<VirtualHost>>>;

/// Host → virtual host cache in front of a [`RouterLoader`].
pub struct VirtualHostCache {
    loader: Arc<dyn RouterLoader>,
    entries: DashMap<String, Slot>,
}

impl VirtualHostCache {
    pub fn new(loader: Arc<dyn RouterLoader>) -> Self {
        Self {
            loader,
            entries: DashMap::new(),
        }
    }

    /// Cached entry for `host`, without loading.
    pub fn get(&self, host: &str) -> Option<Arc<VirtualHost>> {
        self.entries.get(host).and_then(|slot| slot.get().cloned())
    }

    /// Cached entry for `host`, loading it on a miss.
    pub async fn require(&self, host: &str) -> Result<Arc<VirtualHost>, LoadError> {
        if let Some(vhost) = self.get(host) {
            metrics::record_vhost_cache("hit");
            return Ok(vhost);
        }

        let slot: Slot = Arc::clone(&self.entries.entry(host.to_string()).or_default());

        let result = slot
            .get_or_try_init(|| {
                let loader = Arc::clone(&self.loader);
                let host = host.to_string();
                async move {
                    metrics::record_vhost_cache("miss");
                    let vhost = tokio::task::spawn_blocking(move || loader.load(&host))
                        .await
                        .map_err(|e| LoadError::Task(e.to_string()))??;
                    tracing::info!(host = %vhost.host, routes = vhost.router.routes().len(), "Virtual host loaded");
                    Ok::<_, LoadError>(Arc::new(vhost))
                }
            })
            .await
            .cloned();

        if result.is_err() {
            self.entries
                .remove_if(host, |_, current| Arc::ptr_eq(current, &slot) && current.get().is_none());
        }

        result
    }

    /// Evict every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of hosts with a cell, loaded or loading.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handler name → handler, shared by every host a loader produces.
#[derive(Debug, Default)]
pub struct HandlerCache {
    handlers: DashMap<String, Arc<Handler>>,
}

impl HandlerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached handler for `name`, calling `load` on a miss.
    pub fn get_or_load<F>(&self, name: &str, load: F) -> Result<Arc<Handler>, LoadError>
    where
        F: FnOnce(&str) -> Result<Handler, LoadError>,
    {
        if let Some(handler) = self.handlers.get(name) {
            return Ok(Arc::clone(&handler));
        }

        // Load outside the shard lock; a racing load of the same name is
        // harmless and the first insert wins.
        let handler = Arc::new(load(name)?);
        Ok(Arc::clone(
            &self.handlers.entry(name.to_string()).or_insert(handler),
        ))
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
