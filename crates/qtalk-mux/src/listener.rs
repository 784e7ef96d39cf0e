//! TCP convenience helpers.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::session::{Session, DEFAULT_ACCEPT_TIMEOUT};

/// Accepts TCP connections and wraps each in a [`Session`].
pub struct Listener {
    tcp: TcpListener,
    accept_timeout: Duration,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        Ok(Self {
            tcp: TcpListener::bind(addr).await?,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
        })
    }

    /// Override the inbound-accept timeout applied to accepted sessions.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp.local_addr()
    }

    /// Accept the next connection as a running session.
    pub async fn accept(&self) -> std::io::Result<Session> {
        let (stream, addr) = self.tcp.accept().await?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(peer = %addr, "accepted transport");
        Ok(Session::with_accept_timeout(stream, self.accept_timeout))
    }
}

/// Connect to a TCP peer and return a running session.
pub async fn dial(addr: impl ToSocketAddrs) -> std::io::Result<Session> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    Ok(Session::new(stream))
}
