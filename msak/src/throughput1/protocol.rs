//! Sender and receiver loops of the throughput1 protocol
// (c) 2025 Ross Younger

use std::cmp::min;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, header};
use rand::{RngCore as _, SeedableRng as _, rngs::SmallRng};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace};

use super::model::{Measurement, WireMeasurement};
use super::{MAX_RUNTIME, MAX_SCALED_MESSAGE_SIZE, MIN_MESSAGE_SIZE, SCALING_FRACTION,
            SEC_WEBSOCKET_PROTOCOL};
use crate::measurer::Measurer;
use crate::net::ConnInfo;

/// Errors surfaced through a protocol run's error channel.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The WebSocket layer failed or the peer closed the stream.
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    /// A measurement message could not be encoded or decoded.
    #[error("measurement message codec failure: {0}")]
    Codec(#[from] serde_json::Error),
    /// The peer closed the stream with a code other than normal completion.
    #[error("stream closed with unexpected code {0}")]
    UnexpectedClose(u16),
    /// The stream hit its absolute runtime ceiling mid-operation.
    #[error("stream exceeded its maximum runtime")]
    DeadlineExceeded,
}

/// Validates a WebSocket upgrade offer for the throughput1 subprotocol and
/// builds the `101 Switching Protocols` response for it.
///
/// A client that does not offer exactly [`SEC_WEBSOCKET_PROTOCOL`] is
/// rejected; the same subprotocol is echoed in the response.
pub fn upgrade_response<B>(req: &Request<B>) -> Result<Response<Full<Bytes>>, Response<Full<Bytes>>> {
    let headers = req.headers();
    if headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        != Some(SEC_WEBSOCKET_PROTOCOL)
    {
        return Err(bad_request());
    }
    let Some(key) = headers.get(header::SEC_WEBSOCKET_KEY) else {
        return Err(bad_request());
    };
    let accept = derive_accept_key(key.as_bytes());
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .header(header::SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_PROTOCOL)
        .body(Full::new(Bytes::new()))
        .map_err(|_| bad_request())
}

fn bad_request() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    let _ = response
        .headers_mut()
        .insert(header::CONNECTION, header::HeaderValue::from_static("Close"));
    response
}

/// WebSocket stream parameters for a throughput1 test: frames are allowed to
/// grow to the maximum scaled message size, with a little slack for the JSON
/// text frames.
pub(crate) fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_SCALED_MESSAGE_SIZE + 1024);
    config.max_frame_size = Some(MAX_SCALED_MESSAGE_SIZE + 1024);
    config
}

/// State shared between the reader and writer tasks of one stream.
#[derive(Debug)]
struct Shared {
    conn_info: Arc<ConnInfo>,
    /// First-call latch for the identity snapshot: the stream identification
    /// fields go out exactly once, in the first WireMeasurement.
    identity: Once,
    application_bytes_sent: AtomicU64,
    application_bytes_received: AtomicU64,
    byte_limit: u64,
    hard_deadline: Instant,
}

impl Shared {
    /// Builds the one WireMeasurement per stream that carries identification.
    fn identity_snapshot(&self) -> WireMeasurement {
        // An empty congestion control name is expected where the kernel query
        // is unsupported; it is not fatal.
        let cc_algorithm = self.conn_info.get_cc().unwrap_or_else(|e| {
            debug!("failed to read congestion control algorithm: {e}");
            String::new()
        });
        WireMeasurement {
            cc_algorithm,
            uuid: self.conn_info.uuid(),
            local_address: self.conn_info.local_addr().to_string(),
            remote_address: self.conn_info.remote_addr().to_string(),
            measurement: Measurement::default(),
        }
    }
}

/// One throughput1 protocol run over an upgraded WebSocket stream.
///
/// Use [`sender_loop`](Protocol::sender_loop) when this side produces the
/// bulk data (download) and [`receiver_loop`](Protocol::receiver_loop) when
/// the peer does (upload).
#[derive(Debug)]
pub struct Protocol<S> {
    ws: WebSocketStream<S>,
    conn_info: Arc<ConnInfo>,
    rng: SmallRng,
    byte_limit: u64,
}

type LoopChannels = (
    mpsc::Receiver<WireMeasurement>,
    mpsc::Receiver<WireMeasurement>,
    mpsc::Receiver<ProtocolError>,
);

impl<S> Protocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a protocol driver for an upgraded stream.
    pub fn new(ws: WebSocketStream<S>, conn_info: Arc<ConnInfo>) -> Self {
        Self {
            ws,
            conn_info,
            // Each Protocol owns its own PRNG, so simultaneous frame fills on
            // concurrent streams never contend.
            rng: SmallRng::from_entropy(),
            byte_limit: 0,
        }
    }

    /// Sets the number of bytes after which the test stops.
    /// Zero (the default) disables the limit.
    pub fn set_byte_limit(&mut self, limit: u64) {
        self.byte_limit = limit;
    }

    /// Starts the send loop: bulk binary frames towards the peer,
    /// interleaved with measurement messages.
    ///
    /// Returns channels for this side's measurements, the peer's
    /// measurements, and errors. The errors channel MUST be drained by the
    /// caller.
    pub fn sender_loop(self, duration: Duration) -> LoopChannels {
        self.run(duration, true)
    }

    /// Starts the receive (counterflow) loop: bulk data is discarded after
    /// counting, while this side periodically reports its own measurements
    /// back to the sender.
    ///
    /// Returns the same channel triple as [`sender_loop`](Self::sender_loop);
    /// the errors channel MUST be drained by the caller.
    pub fn receiver_loop(self, duration: Duration) -> LoopChannels {
        self.run(duration, false)
    }

    fn run(self, duration: Duration, send_bulk: bool) -> LoopChannels {
        // In no case does this stream outlive MAX_RUNTIME; scope cancellation
        // normally comes much sooner than that.
        let hard_deadline = Instant::now() + MAX_RUNTIME;
        let deadline = min(Instant::now() + duration, hard_deadline);

        let shared = Arc::new(Shared {
            conn_info: Arc::clone(&self.conn_info),
            identity: Once::new(),
            application_bytes_sent: AtomicU64::new(0),
            application_bytes_received: AtomicU64::new(0),
            byte_limit: self.byte_limit,
            hard_deadline,
        });

        let measurer = Arc::new(Measurer::new(Arc::clone(&self.conn_info)));
        let measurements = Arc::clone(&measurer).start(deadline);

        // Separate own/peer channels let the caller know where each
        // WireMeasurement came from.
        let (own_tx, own_rx) = mpsc::channel(100);
        let (peer_tx, peer_rx) = mpsc::channel(100);
        let (err_tx, err_rx) = mpsc::channel(2);

        let (sink, stream) = self.ws.split();
        drop(tokio::spawn(Self::receiver(
            stream,
            Arc::clone(&shared),
            peer_tx,
            err_tx.clone(),
        )));
        if send_bulk {
            drop(tokio::spawn(Self::sender(
                sink,
                shared,
                measurer,
                measurements,
                self.rng,
                deadline,
                own_tx,
                err_tx,
            )));
        } else {
            drop(tokio::spawn(Self::counterflow(
                sink,
                shared,
                measurer,
                measurements,
                deadline,
                own_tx,
                err_tx,
            )));
        }
        (own_rx, peer_rx, err_rx)
    }

    /// Reads from the stream until it ends. Binary frames are discarded after
    /// counting; text frames are decoded and forwarded as the peer's
    /// measurements.
    async fn receiver(
        mut stream: SplitStream<WebSocketStream<S>>,
        shared: Arc<Shared>,
        peer_tx: mpsc::Sender<WireMeasurement>,
        err_tx: mpsc::Sender<ProtocolError>,
    ) {
        loop {
            let message = match timeout_at(shared.hard_deadline, stream.next()).await {
                Err(_) => {
                    let _ = err_tx.send(ProtocolError::DeadlineExceeded).await;
                    return;
                }
                // Stream over: the close handshake completed.
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    let _ = err_tx.send(e.into()).await;
                    return;
                }
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Binary(data) => {
                    let _ = shared
                        .application_bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Message::Text(text) => {
                    let _ = shared
                        .application_bytes_received
                        .fetch_add(text.len() as u64, Ordering::Relaxed);
                    match serde_json::from_str::<WireMeasurement>(&text) {
                        Ok(wm) => {
                            if peer_tx.send(wm).await.is_err() {
                                // Caller went away; nothing left to do here.
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = err_tx.send(e.into()).await;
                            return;
                        }
                    }
                }
                Message::Close(frame) => {
                    // The library completes the close handshake by itself;
                    // the stream ends shortly. Code 1000 means the test
                    // completed; anything else is worth recording.
                    if let Some(frame) = frame {
                        if frame.code != CloseCode::Normal {
                            let _ = err_tx
                                .send(ProtocolError::UnexpectedClose(frame.code.into()))
                                .await;
                        }
                    }
                }
                // Pings and pongs are handled by the library.
                _ => (),
            }
        }
    }

    /// The bulk-data send loop.
    #[allow(clippy::too_many_arguments)]
    async fn sender(
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        shared: Arc<Shared>,
        measurer: Arc<Measurer>,
        mut measurements: mpsc::Receiver<Measurement>,
        mut rng: SmallRng,
        deadline: Instant,
        own_tx: mpsc::Sender<WireMeasurement>,
        err_tx: mpsc::Sender<ProtocolError>,
    ) {
        let mut size = scale_message(MIN_MESSAGE_SIZE as u64, 0, shared.byte_limit) as usize;
        let mut frame = make_binary_frame(&mut rng, size);

        // Binary frames and measurement messages share the socket, so the
        // cadence of outgoing measurements is bounded by how long one binary
        // frame takes to write.
        loop {
            if Instant::now() >= deadline {
                // Final measurement flush before close; errors are moot here.
                let _ = send_wire_measurement(
                    &mut sink,
                    &shared,
                    measurer.measure_once(),
                    &own_tx,
                )
                .await;
                let _ = send_close(&mut sink, &shared).await;
                return;
            }
            match measurements.try_recv() {
                Ok(m) => {
                    if let Err(e) = send_wire_measurement(&mut sink, &shared, m, &own_tx).await {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                    let sent = shared.application_bytes_sent.load(Ordering::Relaxed);
                    // Never write past a configured byte limit.
                    let n = scale_message(size as u64, sent, shared.byte_limit) as usize;
                    let payload = frame[..n].to_vec();
                    match timeout_at(shared.hard_deadline, sink.send(Message::Binary(payload)))
                        .await
                    {
                        Err(_) => {
                            let _ = err_tx.send(ProtocolError::DeadlineExceeded).await;
                            return;
                        }
                        Ok(Err(e)) => {
                            let _ = err_tx.send(e.into()).await;
                            return;
                        }
                        Ok(Ok(())) => (),
                    }
                    let sent = shared
                        .application_bytes_sent
                        .fetch_add(n as u64, Ordering::Relaxed)
                        + n as u64;

                    if shared.byte_limit > 0 && sent >= shared.byte_limit {
                        if let Err(e) = send_wire_measurement(
                            &mut sink,
                            &shared,
                            measurer.measure_once(),
                            &own_tx,
                        )
                        .await
                        {
                            let _ = err_tx.send(e).await;
                            return;
                        }
                        let _ = send_close(&mut sink, &shared).await;
                        return;
                    }

                    // Grow the frame once the stream has warmed up.
                    if size < MAX_SCALED_MESSAGE_SIZE && (size as u64) * SCALING_FRACTION <= sent {
                        size = min(size * 2, MAX_SCALED_MESSAGE_SIZE);
                        frame = make_binary_frame(&mut rng, size);
                    }
                }
            }
        }
    }

    /// The counterflow send loop: no bulk data, just periodic measurement
    /// messages so the sender learns this side's view.
    async fn counterflow(
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        shared: Arc<Shared>,
        measurer: Arc<Measurer>,
        mut measurements: mpsc::Receiver<Measurement>,
        deadline: Instant,
        own_tx: mpsc::Sender<WireMeasurement>,
        err_tx: mpsc::Sender<ProtocolError>,
    ) {
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    let _ = send_wire_measurement(
                        &mut sink,
                        &shared,
                        measurer.measure_once(),
                        &own_tx,
                    )
                    .await;
                    let _ = send_close(&mut sink, &shared).await;
                    return;
                }
                maybe = measurements.recv() => {
                    let Some(m) = maybe else {
                        // Sampler stopped (it shares our deadline); flush and close.
                        let _ = send_wire_measurement(
                            &mut sink,
                            &shared,
                            measurer.measure_once(),
                            &own_tx,
                        )
                        .await;
                        let _ = send_close(&mut sink, &shared).await;
                        return;
                    };
                    let kernel_bytes_received =
                        m.tcp_info.map(|t| t.kernel.bytes_received);
                    if let Err(e) = send_wire_measurement(&mut sink, &shared, m, &own_tx).await {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                    // End the test once enough bytes have been received. A
                    // measurement message just went out, so no extra flush.
                    if shared.byte_limit > 0
                        && kernel_bytes_received.is_some_and(|b| b >= shared.byte_limit)
                    {
                        let _ = send_close(&mut sink, &shared).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Wraps a [`Measurement`] for the wire, injecting the identity snapshot on
/// the stream's first message only, sends it as a text frame, and mirrors it
/// to the local consumer.
async fn send_wire_measurement<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    shared: &Shared,
    measurement: Measurement,
    own_tx: &mpsc::Sender<WireMeasurement>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut wm = WireMeasurement::default();
    shared.identity.call_once(|| wm = shared.identity_snapshot());
    wm.measurement = measurement;

    // Encode separately so the message size is known before sending.
    let encoded = serde_json::to_string(&wm)?;
    let encoded_len = encoded.len() as u64;
    match timeout_at(shared.hard_deadline, sink.send(Message::Text(encoded))).await {
        Err(_) => return Err(ProtocolError::DeadlineExceeded),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(())) => (),
    }
    let _ = shared
        .application_bytes_sent
        .fetch_add(encoded_len, Ordering::Relaxed);

    // Non-blocking: if nobody is reading the local mirror and its buffer is
    // full, the message is simply dropped.
    let _ = own_tx.try_send(wm);
    Ok(())
}

/// Sends the normal-closure frame that marks a completed test.
async fn send_close<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    shared: &Shared,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = "Done sending";
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    };
    match timeout_at(shared.hard_deadline, sink.send(Message::Close(Some(frame)))).await {
        Err(_) => return Err(ProtocolError::DeadlineExceeded),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(())) => (),
    }
    // The closing message is part of the measurement.
    let _ = shared
        .application_bytes_sent
        .fetch_add(2 + reason.len() as u64, Ordering::Relaxed);
    trace!("close frame sent");
    Ok(())
}

/// A fresh binary frame of the requested size, filled from this protocol's
/// randomness source. Random payloads defeat middlebox compression
/// heuristics that would otherwise inflate the measured rate.
fn make_binary_frame(rng: &mut SmallRng, size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}

/// Clamps a binary message size so a configured byte limit is never
/// overshot. A zero limit leaves the size unchanged.
fn scale_message(message_size: u64, bytes_sent: u64, byte_limit: u64) -> u64 {
    if byte_limit == 0 {
        return message_size;
    }
    let excess = (bytes_sent + message_size).saturating_sub(byte_limit);
    message_size.saturating_sub(excess)
}

#[cfg(test)]
mod tests {
    use super::{make_binary_frame, scale_message, upgrade_response, websocket_config};
    use crate::throughput1::{MAX_SCALED_MESSAGE_SIZE, MIN_MESSAGE_SIZE, SEC_WEBSOCKET_PROTOCOL};
    use hyper::{Request, StatusCode, header};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng as _;
    use rand::rngs::SmallRng;

    #[test]
    fn scale_message_no_limit() {
        assert_eq!(scale_message(1024, 0, 0), 1024);
        assert_eq!(scale_message(1024, 10_000_000, 0), 1024);
    }

    #[test]
    fn scale_message_clamps_to_limit() {
        // Limit smaller than the minimum message: single clamped frame.
        assert_eq!(scale_message(MIN_MESSAGE_SIZE as u64, 0, 100), 100);
        // Exactly at the limit: nothing left to send.
        assert_eq!(scale_message(1024, 150_000, 150_000), 0);
        // Partial clamp, no overshoot.
        assert_eq!(scale_message(1024, 149_500, 150_000), 500);
    }

    #[test]
    fn binary_frames_are_randomised() {
        let mut rng = SmallRng::seed_from_u64(42);
        let a = make_binary_frame(&mut rng, 1024);
        let b = make_binary_frame(&mut rng, 1024);
        assert_eq!(a.len(), 1024);
        assert_ne!(a, b);
    }

    #[test]
    fn websocket_config_caps_frames() {
        let cfg = websocket_config();
        assert!(cfg.max_message_size.unwrap() >= MAX_SCALED_MESSAGE_SIZE);
    }

    fn upgrade_request(subprotocol: Option<&str>) -> Request<()> {
        let mut builder = Request::builder()
            .uri("/throughput/v1/download")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, "13");
        if let Some(p) = subprotocol {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, p);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn upgrade_accepts_the_subprotocol() {
        let response = upgrade_response(&upgrade_request(Some(SEC_WEBSOCKET_PROTOCOL))).unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .unwrap(),
            SEC_WEBSOCKET_PROTOCOL
        );
        // RFC 6455 accept token for the sample nonce.
        assert_eq!(
            response
                .headers()
                .get(header::SEC_WEBSOCKET_ACCEPT)
                .unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_rejects_missing_subprotocol() {
        let response = upgrade_response(&upgrade_request(None)).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upgrade_rejects_wrong_subprotocol() {
        let response = upgrade_response(&upgrade_request(Some("some.other.protocol"))).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
