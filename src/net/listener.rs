//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address and network family
//! - Optionally share the port between processes (SO_REUSEPORT)
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Apply TCP keep-alive to accepted sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    #[error("listener closed")]
    Closed,
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections wait until a slot becomes available.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    keepalive: Option<Duration>,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    ///
    /// Binding itself is synchronous so bind errors surface to the caller
    /// before any task is spawned. Must be called within a Tokio runtime.
    pub fn bind(config: &ListenerConfig, idle_timeout: Duration) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let family_ok = match config.network.as_str() {
            "tcp4" => addr.is_ipv4(),
            "tcp6" => addr.is_ipv6(),
            _ => true,
        };
        if !family_ok {
            return Err(ListenerError::Bind(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{addr} is not a {} address", config.network),
            )));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ListenerError::Bind)?;
        socket.set_reuse_address(true).map_err(ListenerError::Bind)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if config.reuseport {
            socket.set_reuse_port(true).map_err(ListenerError::Bind)?;
        }
        if config.network == "tcp6" {
            socket.set_only_v6(true).map_err(ListenerError::Bind)?;
        }
        socket.set_nonblocking(true).map_err(ListenerError::Bind)?;
        socket.bind(&addr.into()).map_err(ListenerError::Bind)?;
        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(ListenerError::Bind)?;

        let listener =
            TcpListener::from_std(std::net::TcpListener::from(socket)).map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            network = %config.network,
            reuseport = config.reuseport,
            max_connections = config.max_connections,
            "Listener bound"
        );

        let keepalive = (config.keepalive && !idle_timeout.is_zero()).then_some(idle_timeout);

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            keepalive,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        if let Some(idle) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP keep-alive");
            }
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This keeps backpressure intact even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(network: &str, addr: &str) -> ListenerConfig {
        ListenerConfig {
            network: network.to_string(),
            bind_address: addr.to_string(),
            max_connections: 2,
            ..ListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = Listener::bind(&config("tcp", "127.0.0.1:0"), Duration::from_secs(60)).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
        assert_eq!(listener.available_permits(), 2);
        assert_eq!(listener.max_connections(), 2);
    }

    #[tokio::test]
    async fn test_bind_rejects_family_mismatch() {
        assert!(matches!(
            Listener::bind(&config("tcp6", "127.0.0.1:0"), Duration::ZERO),
            Err(ListenerError::Bind(_))
        ));
        assert!(matches!(
            Listener::bind(&config("tcp", "not-an-address"), Duration::ZERO),
            Err(ListenerError::Bind(_))
        ));
    }

    #[tokio::test]
    async fn test_permit_held_per_connection() {
        let listener = Listener::bind(&config("tcp4", "127.0.0.1:0"), Duration::from_secs(5)).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();
        assert_eq!(listener.available_permits(), 1);

        drop(permit);
        assert_eq!(listener.available_permits(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reuseport_allows_second_bind() {
        let mut first = config("tcp", "127.0.0.1:0");
        first.reuseport = true;
        let a = Listener::bind(&first, Duration::ZERO).unwrap();

        let mut second = first.clone();
        second.bind_address = a.local_addr().unwrap().to_string();
        let b = Listener::bind(&second, Duration::ZERO).unwrap();
        assert_eq!(a.local_addr().unwrap(), b.local_addr().unwrap());
    }
}
