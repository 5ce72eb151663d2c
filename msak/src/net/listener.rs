//! Listener producing counted, introspectable connections
// (c) 2025 Ross Younger

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::time::Instant;

use super::Conn;

/// A TCP listener whose accepted connections are [`Conn`]s: byte-counted and
/// backed by a duplicated kernel handle for `TCP_INFO` queries.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Wraps an already-bound tokio listener.
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }

    /// Binds to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts one connection.
    ///
    /// The accept time is recorded immediately after the kernel returns the
    /// connection. It is the closest thing we can get to a reference "start
    /// time" for `TCP_INFO` metrics, since the kernel struct has no time
    /// fields of its own.
    pub async fn accept(&self) -> io::Result<Conn> {
        let (stream, _) = self.inner.accept().await?;
        let accept_time = Instant::now();
        Conn::new(stream, accept_time)
    }
}

#[cfg(test)]
mod tests {
    use super::Listener;
    use tokio::net::TcpStream;
    use tokio::time::Instant;

    #[tokio::test]
    async fn accept_records_time_and_endpoints() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let before = Instant::now();
        let _client = TcpStream::connect(addr).await.unwrap();
        let conn = listener.accept().await.unwrap();
        let after = Instant::now();

        let info = conn.info();
        assert!(info.accept_time() >= before);
        assert!(info.accept_time() <= after);
        assert_eq!(info.local_addr(), addr);
        assert_eq!(info.byte_counters(), (0, 0));
    }
}
