//! Server event loops: accept, route, dispatch
// (c) 2025 Ross Younger

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::access::TokenVerifier;
use crate::config::Configuration;
use crate::latency1::{self, engine::Engine};
use crate::net::{Conn, ConnInfo, Listener};
use crate::results::ResultSink;
use crate::throughput1::{self, handler, model::Direction};
use crate::util::cert::load_tls_config;

/// Absolute ceiling on how long a connection may take to present its request
/// headers. Keeps clients and middleboxes from holding idle connections open
/// indefinitely.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Dependencies shared by every request handler.
struct AppState {
    sink: Arc<dyn ResultSink>,
    latency: Arc<Engine>,
    verifier: Option<Arc<dyn TokenVerifier>>,
    machine: String,
}

/// The measurement server: one or two HTTP(S) listeners for throughput1 and
/// the latency1 HTTP surface, plus the latency1 UDP socket.
pub struct Server {
    state: Arc<AppState>,
    ws_listener: Listener,
    wss_listener: Option<(Listener, TlsAcceptor)>,
    latency_socket: Arc<UdpSocket>,
    latency_engine: Arc<Engine>,
}

impl Server {
    /// Binds all sockets per the configuration. The TLS listener only exists
    /// when certificate material is configured.
    pub async fn bind(
        config: &Configuration,
        sink: Arc<dyn ResultSink>,
        verifier: Option<Arc<dyn TokenVerifier>>,
    ) -> anyhow::Result<Self> {
        let ws_listener = Listener::bind(config.ws_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.ws_addr))?;

        let wss_listener = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => {
                let tls = load_tls_config(cert, key)?;
                let listener = Listener::bind(config.wss_addr)
                    .await
                    .with_context(|| format!("failed to bind {}", config.wss_addr))?;
                Some((listener, TlsAcceptor::from(Arc::new(tls))))
            }
            (None, None) => None,
            _ => anyhow::bail!("TLS operation requires both a certificate and a key"),
        };

        let latency_socket = Arc::new(
            UdpSocket::bind(config.latency_addr)
                .await
                .with_context(|| format!("failed to bind {}", config.latency_addr))?,
        );
        let latency_engine = Engine::new(config.latency_ttl(), Arc::clone(&sink));

        let state = Arc::new(AppState {
            sink,
            latency: Arc::clone(&latency_engine),
            verifier,
            machine: config.token_machine.clone(),
        });

        Ok(Self {
            state,
            ws_listener,
            wss_listener,
            latency_socket,
            latency_engine,
        })
    }

    /// The bound cleartext endpoint.
    pub fn ws_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.ws_listener.local_addr()?)
    }

    /// The bound TLS endpoint, when TLS is configured.
    pub fn wss_addr(&self) -> Option<SocketAddr> {
        self.wss_listener
            .as_ref()
            .and_then(|(l, _)| l.local_addr().ok())
    }

    /// The bound latency UDP endpoint.
    pub fn latency_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.latency_socket.local_addr()?)
    }

    /// Runs all event loops. Does not return in normal operation.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("listening for ws tests on {}", self.ws_addr()?);
        if let Some(addr) = self.wss_addr() {
            info!("listening for wss tests on {addr}");
        }
        info!("listening for latency tests on {}", self.latency_addr()?);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let _ = tasks.spawn(
            Arc::clone(&self.latency_engine).process_packet_loop(Arc::clone(&self.latency_socket)),
        );
        let _ = tasks.spawn(Arc::clone(&self.latency_engine).reaper_loop());
        let _ = tasks.spawn(accept_loop(self.ws_listener, Arc::clone(&self.state), None));
        if let Some((listener, acceptor)) = self.wss_listener {
            let _ = tasks.spawn(accept_loop(listener, Arc::clone(&self.state), Some(acceptor)));
        }

        if let Some(result) = tasks.join_next().await {
            result.context("server task panicked")?;
            anyhow::bail!("server task exited unexpectedly");
        }
        Ok(())
    }
}

/// Accepts connections forever, spawning one serving task per connection.
async fn accept_loop(listener: Listener, state: Arc<AppState>, tls: Option<TlsAcceptor>) {
    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let state = Arc::clone(&state);
        match tls.clone() {
            None => {
                let info = conn.info();
                drop(tokio::spawn(serve_connection(conn, info, state)));
            }
            Some(acceptor) => {
                drop(tokio::spawn(serve_tls_connection(conn, acceptor, state)));
            }
        }
    }
}

async fn serve_tls_connection(conn: Conn, acceptor: TlsAcceptor, state: Arc<AppState>) {
    // The kernel handle is extracted before the TLS wrap so the measurement
    // layers keep their view of the underlying TCP connection.
    let info = conn.info();
    match acceptor.accept(conn).await {
        Ok(stream) => serve_connection(stream, info, state).await,
        Err(e) => debug!("TLS handshake failed for {}: {e}", info.remote_addr()),
    }
}

/// Serves HTTP/1.1 on one accepted connection, with upgrade support.
async fn serve_connection<S>(io: S, conn_info: Arc<ConnInfo>, state: Arc<AppState>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let conn_info = Arc::clone(&conn_info);
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(route(req, conn_info, state)) }
    });
    let mut builder = http1::Builder::new();
    let _ = builder
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    if let Err(e) = builder
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!("connection ended: {e}");
    }
}

/// Dispatches one request to its protocol handler.
fn route(
    req: Request<Incoming>,
    conn_info: Arc<ConnInfo>,
    state: Arc<AppState>,
) -> Response<Full<Bytes>> {
    match req.uri().path() {
        throughput1::DOWNLOAD_PATH => handler::handle(
            Direction::Download,
            req,
            conn_info,
            Arc::clone(&state.sink),
            state.verifier.clone(),
            state.machine.clone(),
        ),
        throughput1::UPLOAD_PATH => handler::handle(
            Direction::Upload,
            req,
            conn_info,
            Arc::clone(&state.sink),
            state.verifier.clone(),
            state.machine.clone(),
        ),
        latency1::AUTHORIZE_PATH => {
            state
                .latency
                .authorize(&req, state.verifier.as_deref(), &state.machine)
        }
        latency1::RESULT_PATH => {
            state
                .latency
                .result(&req, state.verifier.as_deref(), &state.machine)
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}
