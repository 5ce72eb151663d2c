//! Session cache, UDP loops and HTTP handlers for latency1
// (c) 2025 Ross Younger

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, header};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::model::{LatencyPacket, PacketKind, Session};
use super::{AVG_SEND_INTERVAL, MAX_PACKET_SIZE, MAX_SEND_INTERVAL, MIN_SEND_INTERVAL,
            SEND_DURATION};
use crate::access::{self, TokenVerifier};
use crate::results::ResultSink;
use crate::util::memoryless::Memoryless;

/// Errors from packet processing and the probe send loop.
#[derive(Debug, thiserror::Error)]
pub enum LatencyError {
    /// The datagram was not a valid latency packet.
    #[error("unparseable packet: {0}")]
    Decode(#[from] serde_json::Error),
    /// The packet referenced a measurement id we know nothing about.
    #[error("unauthorized")]
    Unauthorized,
    /// The echo carried a sequence number we never sent.
    #[error("invalid sequence number {0}")]
    InvalidSequence(usize),
    /// A probe datagram was only partially written.
    #[error("partial write")]
    PartialWrite,
    /// The probe socket failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct CacheEntry {
    session: Arc<Session>,
    expires_at: Instant,
}

/// Coordinates latency1 sessions: a TTL cache keyed by measurement id, the
/// shared UDP receive loop, and one probe send loop per kicked-off session.
pub struct Engine {
    /// All cache access goes through this one mutex. Reads do not refresh an
    /// entry's TTL: a session lives exactly `ttl` from authorization, then
    /// gets archived.
    sessions: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    sink: Arc<dyn ResultSink>,
}

impl Engine {
    /// An engine whose sessions are archived to `sink` after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, sink: Arc<dyn ResultSink>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            sink,
        })
    }

    fn insert(&self, session: Arc<Session>) {
        let entry = CacheEntry {
            expires_at: Instant::now() + self.ttl,
            session,
        };
        let mut sessions = self.sessions.lock().expect("session cache mutex poisoned");
        let _ = sessions.insert(entry.session.id.clone(), entry);
    }

    fn get(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().expect("session cache mutex poisoned");
        sessions.get(id).map(|entry| Arc::clone(&entry.session))
    }

    fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().expect("session cache mutex poisoned");
        sessions.remove(id).map(|entry| entry.session)
    }

    /// Creates a session for `GET /latency/v1/authorize` and responds with
    /// the kickoff packet the client must send over UDP.
    pub(crate) fn authorize<B>(
        &self,
        req: &Request<B>,
        verifier: Option<&dyn TokenVerifier>,
        machine: &str,
    ) -> Response<Full<Bytes>> {
        let query = access::parse_query(req.uri().query());
        let Some(mid) = access::measurement_id(&query, verifier, machine) else {
            info!("latency authorize request without mid");
            return error_response(StatusCode::UNAUTHORIZED);
        };

        self.insert(Arc::new(Session::new(mid.clone())));
        debug!("latency session created: {mid}");

        let kickoff = LatencyPacket {
            kind: PacketKind::C2s,
            id: mid,
            seq: 0,
            last_rtt: 0,
        };
        match serde_json::to_vec(&kickoff) {
            Ok(body) => Response::new(Full::new(Bytes::from(body))),
            Err(e) => {
                error!("cannot marshal kickoff packet: {e}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Answers `GET /latency/v1/result` with the session summary, then drops
    /// (and archives) the session.
    pub(crate) fn result<B>(
        &self,
        req: &Request<B>,
        verifier: Option<&dyn TokenVerifier>,
        machine: &str,
    ) -> Response<Full<Bytes>> {
        let query = access::parse_query(req.uri().query());
        let Some(mid) = access::measurement_id(&query, verifier, machine) else {
            info!("latency result request without mid");
            return error_response(StatusCode::BAD_REQUEST);
        };

        let Some(session) = self.get(&mid) else {
            return error_response(StatusCode::NOT_FOUND);
        };
        let body = match serde_json::to_vec(&session.summarize()) {
            Ok(body) => body,
            Err(e) => {
                error!("cannot marshal summary for {mid}: {e}");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        // The session is done: archive it now rather than waiting for the TTL.
        if let Some(session) = self.remove(&mid) {
            self.archive(&session);
        }
        Response::new(Full::new(Bytes::from(body)))
    }

    /// The main packet processing loop; owns the UDP socket's receive side.
    pub async fn process_packet_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("accepting latency1 packets on {:?}", socket.local_addr().ok());
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (n, remote) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("error while reading UDP packet: {e}");
                    continue;
                }
            };
            // Take the receive timestamp as soon as possible after the read,
            // to keep added jitter out of the RTT.
            let receive_time = Instant::now();
            if let Err(e) = self.process_packet(&socket, remote, &buf[..n], receive_time) {
                debug!("failed to process packet from {remote}: {e}");
            }
        }
    }

    /// Dispatches one datagram by session id and packet type.
    fn process_packet(
        &self,
        socket: &Arc<UdpSocket>,
        remote: SocketAddr,
        packet: &[u8],
        receive_time: Instant,
    ) -> Result<(), LatencyError> {
        let m: LatencyPacket = serde_json::from_slice(packet)?;
        let session = self.get(&m.id).ok_or(LatencyError::Unauthorized)?;

        match m.kind {
            // A server probe echoed back by the client: match it to its send
            // time and store the RTT.
            PacketKind::S2c => {
                let rtt = session
                    .record_echo(m.seq, receive_time)
                    .ok_or(LatencyError::InvalidSequence(m.seq))?;
                debug!("echo received: id {} seq {} rtt {rtt}us", m.id, m.seq);
                Ok(())
            }
            // The kickoff. The first one starts the probe loop for this
            // session; repeats are ignored.
            PacketKind::C2s => {
                let local = socket.local_addr()?;
                if session.start(remote, local) {
                    let socket = Arc::clone(socket);
                    drop(tokio::spawn(async move {
                        let id = session.id.clone();
                        if let Err(e) = send_loop(socket, remote, session).await {
                            debug!("latency send loop for {id} ended: {e}");
                        }
                    }));
                }
                Ok(())
            }
        }
    }

    /// Periodically drops expired sessions out of the cache and archives
    /// them.
    pub async fn reaper_loop(self: Arc<Self>) {
        let interval = (self.ttl / 10).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            let _ = ticker.tick().await;
            self.evict_expired();
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().expect("session cache mutex poisoned");
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| sessions.remove(id).map(|entry| entry.session))
                .collect()
        };
        for session in expired {
            debug!("latency session expired: {}", session.id);
            self.archive(&session);
        }
    }

    fn archive(&self, session: &Session) {
        let archive = session.archive(Utc::now());
        let value = match serde_json::to_value(&archive) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to serialize latency result for {}: {e}", archive.id);
                return;
            }
        };
        if let Err(e) = self
            .sink
            .write("latency1", "application", &archive.id, &value)
        {
            warn!("failed to write latency result for {}: {e}", archive.id);
        }
    }
}

/// Sends probes with progressive sequence numbers until the send window
/// closes. Probe intervals are memoryless so they cannot align with cyclic
/// network behaviour.
async fn send_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    session: Arc<Session>,
) -> Result<(), LatencyError> {
    let deadline = Instant::now() + SEND_DURATION;
    let Ok(mut ticker) = Memoryless::new(AVG_SEND_INTERVAL, MIN_SEND_INTERVAL, MAX_SEND_INTERVAL)
    else {
        debug!("probe interval constants are invalid (this is a bug)");
        return Ok(());
    };
    let mut seq = 0;
    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return Ok(()),
            () = ticker.wait() => {
                let packet = serde_json::to_vec(&LatencyPacket {
                    kind: PacketKind::S2c,
                    id: session.id.clone(),
                    seq,
                    last_rtt: session.last_rtt(),
                })?;

                // Take the timestamp just before the write: the RTT then
                // includes the probe's own write time. This is intentional;
                // the kernel's socket buffers dwarf these packets, so the
                // write itself is expected to take negligible time.
                let send_time = Instant::now();
                let n = socket.send_to(&packet, remote).await?;
                if n != packet.len() {
                    return Err(LatencyError::PartialWrite);
                }

                // Only a fully sent probe is accounted; its entry stays
                // "lost" until the echo shows up.
                session.record_send(send_time);
                seq += 1;
                debug!("probe sent: id {} seq {seq} len {n}", session.id);
            }
        }
    }
}

fn error_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    let _ = response
        .headers_mut()
        .insert(header::CONNECTION, header::HeaderValue::from_static("Close"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency1::model::RoundTrip;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    /// Captures archived records instead of writing files.
    #[derive(Default)]
    struct CapturingSink {
        records: StdMutex<Vec<(String, String, serde_json::Value)>>,
    }
    impl ResultSink for CapturingSink {
        fn write(
            &self,
            datatype: &str,
            _subkind: &str,
            id: &str,
            record: &serde_json::Value,
        ) -> anyhow::Result<PathBuf> {
            self.records.lock().unwrap().push((
                datatype.to_string(),
                id.to_string(),
                record.clone(),
            ));
            Ok(PathBuf::from("/dev/null"))
        }
    }

    fn engine(ttl: Duration) -> (Arc<Engine>, Arc<CapturingSink>) {
        let sink = Arc::new(CapturingSink::default());
        (Engine::new(ttl, sink.clone()), sink)
    }

    async fn socket_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (Arc::new(server), client)
    }

    fn http_request(path_and_query: &str) -> Request<()> {
        Request::builder().uri(path_and_query).body(()).unwrap()
    }

    #[tokio::test]
    async fn authorize_creates_session_and_kickoff() {
        let (engine, _sink) = engine(Duration::from_secs(60));
        let response = engine.authorize(&http_request("/latency/v1/authorize?mid=t"), None, "");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(engine.get("t").is_some());
    }

    #[tokio::test]
    async fn authorize_without_mid_is_unauthorized() {
        let (engine, _sink) = engine(Duration::from_secs(60));
        let response = engine.authorize(&http_request("/latency/v1/authorize"), None, "");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "Close");
    }

    #[tokio::test]
    async fn result_codes() {
        let (engine, sink) = engine(Duration::from_secs(60));
        // No mid: 400.
        let response = engine.result(&http_request("/latency/v1/result"), None, "");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // Unknown mid: 404.
        let response = engine.result(&http_request("/latency/v1/result?mid=x"), None, "");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        // Known mid: 200, and the session is archived and gone.
        let _ = engine.authorize(&http_request("/latency/v1/authorize?mid=t"), None, "");
        let response = engine.result(&http_request("/latency/v1/result?mid=t"), None, "");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(engine.get("t").is_none());
        assert_eq!(sink.records.lock().unwrap().len(), 1);
        let response = engine.result(&http_request("/latency/v1/result?mid=t"), None, "");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_session_packets_are_unauthorized() {
        let (engine, _sink) = engine(Duration::from_secs(60));
        let (server, _client) = socket_pair().await;
        let packet = br#"{"type":"c2s","id":"nope","seq":0}"#;
        let err = engine
            .process_packet(&server, "127.0.0.1:9000".parse().unwrap(), packet, Instant::now())
            .unwrap_err();
        assert!(matches!(err, LatencyError::Unauthorized));
    }

    #[tokio::test]
    async fn garbage_packets_are_dropped() {
        let (engine, _sink) = engine(Duration::from_secs(60));
        let (server, _client) = socket_pair().await;
        let err = engine
            .process_packet(&server, "127.0.0.1:9000".parse().unwrap(), b"not json", Instant::now())
            .unwrap_err();
        assert!(matches!(err, LatencyError::Decode(_)));
    }

    #[tokio::test]
    async fn echo_with_bad_seq_is_rejected() {
        let (engine, _sink) = engine(Duration::from_secs(60));
        let (server, _client) = socket_pair().await;
        let _ = engine.authorize(&http_request("/x?mid=t"), None, "");
        let packet = br#"{"type":"s2c","id":"t","seq":5}"#;
        let err = engine
            .process_packet(&server, "127.0.0.1:9000".parse().unwrap(), packet, Instant::now())
            .unwrap_err();
        assert!(matches!(err, LatencyError::InvalidSequence(5)));
    }

    #[tokio::test]
    async fn kickoff_starts_probes_and_echo_is_measured() {
        let (engine, _sink) = engine(Duration::from_secs(60));
        let (server, client) = socket_pair().await;
        let server_addr = server.local_addr().unwrap();
        let _ = engine.authorize(&http_request("/x?mid=t"), None, "");

        // Deliver the kickoff from the client's address.
        let kickoff = br#"{"type":"c2s","id":"t","seq":0}"#;
        engine
            .process_packet(
                &server,
                client.local_addr().unwrap(),
                kickoff,
                Instant::now(),
            )
            .unwrap();
        // A second kickoff must not spawn another loop.
        engine
            .process_packet(
                &server,
                client.local_addr().unwrap(),
                kickoff,
                Instant::now(),
            )
            .unwrap();

        // The send loop delivers a probe to the client within its interval
        // bounds; echo it back through the dispatcher.
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (n, from) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("no probe within a second")
            .unwrap();
        assert_eq!(from, server_addr);
        let probe: LatencyPacket = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(probe.kind, PacketKind::S2c);
        assert_eq!(probe.id, "t");
        assert_eq!(probe.seq, 0);

        let echo = serde_json::to_vec(&probe).unwrap();
        engine
            .process_packet(
                &server,
                client.local_addr().unwrap(),
                &echo,
                Instant::now(),
            )
            .unwrap();

        let session = engine.get("t").unwrap();
        let summary = session.summarize();
        assert!(summary.packets_sent >= 1);
        assert_eq!(summary.packets_received, 1);
        assert_eq!(summary.round_trips[0].lost, false);
        assert!(summary.round_trips[0].rtt > 0);
    }

    #[tokio::test]
    async fn expired_sessions_are_archived() {
        let (engine, sink) = engine(Duration::from_millis(1));
        let _ = engine.authorize(&http_request("/x?mid=t"), None, "");
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.evict_expired();
        assert!(engine.get("t").is_none());
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "latency1");
        assert_eq!(records[0].1, "t");
        assert!(records[0].2["end_time"].is_string());
    }

    #[test]
    fn summary_counts_only_non_lost() {
        let session = Session::new("t".into());
        let t0 = Instant::now();
        session.record_send(t0);
        session.record_send(t0);
        let _ = session.record_echo(0, t0 + Duration::from_millis(5));
        let summary = session.summarize();
        assert_eq!(summary.packets_sent, 2);
        assert_eq!(summary.packets_received, 1);
        assert_eq!(
            summary.round_trips[1],
            RoundTrip { rtt: 0, lost: true }
        );
    }
}
