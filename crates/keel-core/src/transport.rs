//! Transport abstraction for stream-oriented links.
//!
//! Production uses tokio TCP, tests use turmoil's simulated TCP. Protocol
//! logic only ever sees an ordered byte stream per connection.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Listening transport that also dials peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bidirectional byte stream to one peer.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept an incoming connection.
    ///
    /// Blocks until a peer connects and returns the stream with the peer's
    /// address.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Connect to a remote endpoint.
    async fn connect(&self, remote: SocketAddr) -> io::Result<Self::Stream>;

    /// Address this transport listens on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
