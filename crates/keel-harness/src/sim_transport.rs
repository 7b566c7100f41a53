//! Simulated TCP.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use keel_core::Transport;
use turmoil::{
    ToSocketAddrs,
    net::{TcpListener, TcpStream},
};

/// Turmoil TCP listener that also dials peers.
///
/// A transport built with [`SimTransport::dialer`] only dials; accepting on it
/// fails.
pub struct SimTransport {
    listener: Option<TcpListener>,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport").field("listening", &self.listener.is_some()).finish()
    }
}

impl SimTransport {
    /// Listen on `addr` of the current simulated host.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener: Some(listener) })
    }

    /// Transport that only dials.
    pub fn dialer() -> Self {
        Self { listener: None }
    }

    /// Dial `addr`, which may name a simulated host (`"node2:7100"`).
    pub async fn connect_to(addr: impl ToSocketAddrs) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }

    fn listener(&self) -> io::Result<&TcpListener> {
        self.listener.as_ref().ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport does not listen"))
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener()?.accept().await
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(remote).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener()?.local_addr()
    }
}
