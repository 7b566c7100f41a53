//! Production environment and transport.

use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use keel_core::{Environment, Transport};
use tokio::net::{TcpListener, TcpStream};

/// System clock, tokio timers and OS randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        if let Err(err) = getrandom::fill(buf) {
            // Only session ids are drawn from here; keep them distinct even
            // without an entropy source.
            tracing::error!(error = %err, "OS randomness unavailable");
            let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos());
            for (b, n) in buf.iter_mut().zip(nanos.to_le_bytes().iter().cycle()) {
                *b ^= *n;
            }
        }
    }
}

/// TCP listener that also dials peers.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Listen on `addr`.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn random_bytes_are_not_all_zero() {
        let mut buf = [0u8; 32];
        SystemEnv.random_bytes(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
        assert!(SystemEnv.wall_clock_millis() > 1_600_000_000_000);
    }

    #[tokio::test]
    async fn tcp_transport_round_trip() {
        let server = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let dialer = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (mut client, (mut accepted, _)) = tokio::join!(
            async { dialer.connect(addr).await.unwrap() },
            async { server.accept().await.unwrap() }
        );

        client.write_all(b"keel").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"keel");
    }
}
