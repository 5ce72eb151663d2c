//! An accepted stream connection, extended with byte counters and a kernel handle
// (c) 2025 Ross Younger

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

#[cfg(unix)]
use std::os::fd::{AsFd as _, OwnedFd};

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::os;

/// Everything about an accepted connection that must outlive the stream
/// itself.
///
/// The HTTP layer hijacks the stream on WebSocket upgrade and TLS may wrap
/// it, but handlers still need the byte counters and the kernel queries. The
/// duplicated file descriptor held here keeps those working independently of
/// whatever happens to the connection's own handle; both are released when
/// the last reference is dropped.
#[derive(Debug)]
pub struct ConnInfo {
    local: SocketAddr,
    remote: SocketAddr,
    accept_time: Instant,
    #[cfg(unix)]
    fd: Option<OwnedFd>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    uuid: OnceLock<String>,
}

impl ConnInfo {
    /// The local (server) endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The remote (client) endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// The instant the kernel handed us this connection. Set exactly once,
    /// before any I/O; this is the reference zero for `TCP_INFO` elapsed time.
    pub fn accept_time(&self) -> Instant {
        self.accept_time
    }

    /// Returns a consistent snapshot of the (read, written) byte counters.
    pub fn byte_counters(&self) -> (u64, u64) {
        (
            self.bytes_read.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn add_bytes_read(&self, n: u64) {
        let _ = self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        let _ = self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    /// Sets the congestion control algorithm on the underlying socket.
    ///
    /// Failure is expected when the algorithm is not available on this kernel
    /// (or on this platform at all); callers treat it as non-fatal.
    pub fn set_cc(&self, name: &str) -> Result<(), os::Error> {
        os::set_congestion_control(self.fd()?, name)
    }

    /// Reads the active congestion control algorithm.
    pub fn get_cc(&self) -> Result<String, os::Error> {
        os::get_congestion_control(self.fd()?)
    }

    /// Best-effort snapshot of kernel state for this connection.
    ///
    /// The first element is only present while BBR is the active congestion
    /// control algorithm. The whole call fails with
    /// [`Unsupported`](os::Error::Unsupported) where `TCP_INFO` is
    /// unavailable; callers must tolerate that.
    pub fn kernel_info(&self) -> Result<(Option<os::CcInfo>, os::TcpInfo), os::Error> {
        let fd = self.fd()?;
        let cc_info = match os::get_congestion_control(fd) {
            Ok(name) if name.starts_with("bbr") => os::bbr_info(fd).ok(),
            _ => None,
        };
        let tcp_info = os::tcp_info(fd)?;
        Ok((cc_info, tcp_info))
    }

    /// A stable identifier for this connection.
    ///
    /// Derived from the kernel socket cookie where available, otherwise a
    /// freshly generated time-based UUID. Computed once and cached; repeated
    /// calls always return the same value.
    pub fn uuid(&self) -> String {
        self.uuid
            .get_or_init(|| {
                self.fd()
                    .ok()
                    .and_then(|fd| os::socket_cookie(fd).ok())
                    .map_or_else(
                        || uuid::Uuid::now_v7().to_string(),
                        |cookie| format!("{cookie:016x}"),
                    )
            })
            .clone()
    }

    #[cfg(unix)]
    fn fd(&self) -> Result<std::os::fd::BorrowedFd<'_>, os::Error> {
        self.fd.as_ref().map(|f| f.as_fd()).ok_or(os::Error::NoHandle)
    }
}

/// An accepted TCP connection which updates byte counters on every I/O and
/// shares a [`ConnInfo`] with whoever needs it later.
#[derive(Debug)]
pub struct Conn {
    stream: TcpStream,
    info: Arc<ConnInfo>,
}

impl Conn {
    /// Wraps a freshly accepted stream. `accept_time` must be captured as
    /// early as possible after the kernel returned the connection.
    pub(crate) fn new(stream: TcpStream, accept_time: Instant) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        #[cfg(unix)]
        let fd = match stream.as_fd().try_clone_to_owned() {
            Ok(fd) => Some(fd),
            Err(e) => {
                tracing::warn!("could not duplicate socket descriptor for {remote}: {e}");
                None
            }
        };
        Ok(Self {
            stream,
            info: Arc::new(ConnInfo {
                local,
                remote,
                accept_time,
                #[cfg(unix)]
                fd,
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                uuid: OnceLock::new(),
            }),
        })
    }

    /// Shared handle to this connection's metadata and kernel queries.
    pub fn info(&self) -> Arc<ConnInfo> {
        Arc::clone(&self.info)
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            self.info.add_bytes_read(n as u64);
        }
        result
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            self.info.add_bytes_written(*n as u64);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.stream).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = &result {
            self.info.add_bytes_written(*n as u64);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::Conn;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::Instant;

    async fn accepted_pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Conn::new(server, Instant::now()).unwrap(), client)
    }

    #[tokio::test]
    async fn counters_track_io() {
        let (mut conn, mut client) = accepted_pair().await;
        let info = conn.info();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(b"world!").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf2 = [0u8; 6];
        client.read_exact(&mut buf2).await.unwrap();

        let (read, written) = info.byte_counters();
        assert_eq!(read, 5);
        assert_eq!(written, 6);
    }

    #[tokio::test]
    async fn uuid_is_stable() {
        let (conn, _client) = accepted_pair().await;
        let info = conn.info();
        let a = info.uuid();
        let b = info.uuid();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[cfg(linux)]
    #[tokio::test]
    async fn kernel_info_works_on_linux() {
        let (conn, _client) = accepted_pair().await;
        let info = conn.info();
        let cc = info.get_cc().unwrap();
        assert!(!cc.is_empty());
        let (_cc_info, tcp_info) = info.kernel_info().unwrap();
        assert!(tcp_info.snd_mss > 0);
    }
}
