//! HTTP-side handling of throughput1 tests: option validation, upgrade,
//! archival
// (c) 2025 Ross Younger

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use super::model::{CcAlgorithm, Direction, NameValue, Throughput1Result};
use super::protocol::{Protocol, ProtocolError};
use super::{DEFAULT_DURATION, protocol};
use crate::access::{self, TokenVerifier};
use crate::net::ConnInfo;
use crate::results::ResultSink;
use crate::util::stats::DataRate;
use crate::version;

/// Upper bound on a metadata key, to limit abuse.
const MAX_METADATA_KEY_LENGTH: usize = 50;
/// Upper bound on a metadata value.
const MAX_METADATA_VALUE_LENGTH: usize = 512;

/// The querystring parameters recognized as protocol options. Anything else
/// is client metadata.
const KNOWN_OPTIONS: &[&str] = &["streams", "duration", "delay", "cc", "bytes", "access_token", "mid"];

/// Validated request options for one throughput1 stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestOptions {
    pub(crate) mid: String,
    pub(crate) duration: Duration,
    pub(crate) cc: Option<CcAlgorithm>,
    pub(crate) byte_limit: u64,
    pub(crate) client_options: Vec<NameValue>,
    pub(crate) client_metadata: Vec<NameValue>,
}

/// Parses and validates the recognized options, collecting everything else
/// as bounded client metadata. Errors describe the offending option.
pub(crate) fn parse_options(
    query: &[(String, String)],
    mid: String,
) -> Result<RequestOptions, String> {
    let mut client_options = Vec::new();

    // A streams count is required, though its value is advisory.
    let streams = access::query_value(query, "streams").unwrap_or_default();
    if streams.is_empty() {
        return Err("missing streams".into());
    }
    client_options.push(NameValue {
        name: "streams".into(),
        value: streams.into(),
    });

    let mut duration = DEFAULT_DURATION;
    if let Some(value) = access::query_value(query, "duration") {
        // The provided duration must be milliseconds.
        match value.parse::<u64>() {
            Ok(ms) => {
                duration = Duration::from_millis(ms);
                client_options.push(NameValue {
                    name: "duration".into(),
                    value: value.into(),
                });
            }
            Err(_) => return Err(format!("invalid duration {value:?}")),
        }
    }

    let mut cc = None;
    if let Some(value) = access::query_value(query, "cc") {
        // Validate here; it can only be applied once there is a connection.
        match value.parse::<CcAlgorithm>() {
            Ok(algorithm) => {
                cc = Some(algorithm);
                client_options.push(NameValue {
                    name: "cc".into(),
                    value: value.into(),
                });
            }
            Err(_) => return Err(format!("requested cc algorithm {value:?} is not allowed")),
        }
    }

    if let Some(value) = access::query_value(query, "delay") {
        client_options.push(NameValue {
            name: "delay".into(),
            value: value.into(),
        });
    }

    let mut byte_limit = 0;
    if let Some(value) = access::query_value(query, "bytes") {
        match value.parse::<u64>() {
            Ok(limit) => {
                byte_limit = limit;
                client_options.push(NameValue {
                    name: "bytes".into(),
                    value: value.into(),
                });
            }
            Err(_) => return Err(format!("invalid byte limit {value:?}")),
        }
    }

    // Everything not recognized as an option is client metadata, bounded to
    // limit abuse and recorded verbatim.
    let mut client_metadata = Vec::new();
    for (name, value) in query {
        if KNOWN_OPTIONS.contains(&name.as_str()) {
            continue;
        }
        if name.len() > MAX_METADATA_KEY_LENGTH || value.len() > MAX_METADATA_VALUE_LENGTH {
            return Err("maximum metadata key or value length exceeded".into());
        }
        client_metadata.push(NameValue {
            name: name.clone(),
            value: value.clone(),
        });
    }

    Ok(RequestOptions {
        mid,
        duration,
        cc,
        byte_limit,
        client_options,
        client_metadata,
    })
}

/// Handles a throughput1 request end to end: validates options, upgrades to
/// WebSocket, and spawns the measurement run on the upgraded connection.
pub(crate) fn handle<B>(
    direction: Direction,
    mut req: Request<B>,
    conn_info: Arc<ConnInfo>,
    sink: Arc<dyn ResultSink>,
    verifier: Option<Arc<dyn TokenVerifier>>,
    machine: String,
) -> Response<Full<Bytes>>
where
    B: Send + 'static,
{
    let query = access::parse_query(req.uri().query());
    let Some(mid) = access::measurement_id(&query, verifier.as_deref(), &machine) else {
        info!(
            "received {direction} request without mid (source {})",
            conn_info.remote_addr()
        );
        return bad_request();
    };
    let options = match parse_options(&query, mid) {
        Ok(options) => options,
        Err(reason) => {
            info!(
                "rejecting {direction} request (source {}): {reason}",
                conn_info.remote_addr()
            );
            return bad_request();
        }
    };

    // Everything looks good; build the upgrade response. Once it is sent the
    // TCP connection is hijacked and errors can no longer be reported over
    // HTTP: the protocol owns the stream and will close it.
    let response = match protocol::upgrade_response(&req) {
        Ok(response) => response,
        Err(rejection) => {
            info!(
                "websocket upgrade rejected (source {})",
                conn_info.remote_addr()
            );
            return rejection;
        }
    };

    drop(tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                run_measurement(direction, TokioIo::new(upgraded), conn_info, options, sink).await;
            }
            Err(e) => info!("websocket upgrade failed: {e}"),
        }
    }));
    response
}

/// Terminal condition of a stream, for logging. Clean and abnormal closures
/// both count as successful tests; so does running out the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Success,
    UnexpectedClose,
    Failed,
}

fn classify(error: &ProtocolError) -> Terminal {
    use tokio_tungstenite::tungstenite::Error as WsError;
    use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
    match error {
        // A clean closure means the peer finished the test.
        ProtocolError::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
            Terminal::Success
        }
        // Clients commonly drop the connection without a closing handshake;
        // that is still a completed test.
        ProtocolError::WebSocket(WsError::Protocol(
            WsProtocolError::ResetWithoutClosingHandshake,
        )) => Terminal::Success,
        ProtocolError::UnexpectedClose(_) => Terminal::UnexpectedClose,
        // The clock running out is a success with partial results.
        ProtocolError::DeadlineExceeded => Terminal::Success,
        ProtocolError::WebSocket(_) | ProtocolError::Codec(_) => Terminal::Failed,
    }
}

/// Runs one stream to completion and archives exactly one record for it,
/// whatever the terminal condition was.
async fn run_measurement<S>(
    direction: Direction,
    io: S,
    conn_info: Arc<ConnInfo>,
    options: RequestOptions,
    sink: Arc<dyn ResultSink>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let ws = WebSocketStream::from_raw_socket(io, Role::Server, Some(protocol::websocket_config()))
        .await;

    // A requested congestion control algorithm can only be applied now that
    // the connection exists. Failure is not fatal: the kernel may not offer
    // the algorithm, in which case the test runs with the default and the
    // archival record shows requested vs. actual.
    if let Some(cc) = options.cc {
        if let Err(e) = conn_info.set_cc(&cc.to_string()) {
            info!(
                "failed to set congestion control {cc} (source {}): {e}",
                conn_info.remote_addr()
            );
        }
    }

    let uuid = conn_info.uuid();
    let start_time = Utc::now();
    let mut record = Throughput1Result {
        git_commit: version::git_commit().into(),
        version: version::short(),
        direction,
        measurement_id: options.mid,
        uuid: uuid.clone(),
        server: conn_info.local_addr().to_string(),
        client: conn_info.remote_addr().to_string(),
        cc_algorithm: String::new(),
        start_time,
        end_time: start_time,
        server_measurements: Vec::new(),
        client_measurements: Vec::new(),
        client_options: options.client_options,
        client_metadata: options.client_metadata,
    };

    let mut proto = Protocol::new(ws, Arc::clone(&conn_info));
    proto.set_byte_limit(options.byte_limit);
    let (mut own_rx, mut peer_rx, mut err_rx) = match direction {
        Direction::Download => proto.sender_loop(options.duration),
        Direction::Upload => proto.receiver_loop(options.duration),
    };

    // The stream normally ends itself at the requested duration (final
    // measurement flush, then a close frame); allow it a moment beyond that
    // before giving up on the drain.
    let drain_deadline = tokio::time::sleep(options.duration + Duration::from_secs(1));
    tokio::pin!(drain_deadline);
    let mut terminal = Terminal::Success;
    loop {
        tokio::select! {
            () = &mut drain_deadline => {
                debug!("stream {uuid} timed out; archiving partial results");
                break;
            }
            Some(wm) = own_rx.recv() => {
                // For a download we are the data sender, so our own first
                // message carries the congestion control algorithm in use.
                if direction == Direction::Download && !wm.cc_algorithm.is_empty() {
                    record.cc_algorithm = wm.cc_algorithm.clone();
                }
                record.server_measurements.push(wm.measurement);
            }
            Some(wm) = peer_rx.recv() => {
                // For an upload the client is the sender; if it ever reports
                // its algorithm, record it.
                if direction == Direction::Upload && !wm.cc_algorithm.is_empty() {
                    record.cc_algorithm = wm.cc_algorithm.clone();
                }
                record.client_measurements.push(wm.measurement);
            }
            maybe_err = err_rx.recv() => {
                if let Some(e) = maybe_err {
                    terminal = classify(&e);
                    match terminal {
                        Terminal::Success => debug!("stream {uuid} closed: {e}"),
                        Terminal::UnexpectedClose => info!("stream {uuid} closed unexpectedly: {e}"),
                        Terminal::Failed => info!("stream {uuid} failed: {e}"),
                    }
                }
                break;
            }
        }
    }
    record.end_time = Utc::now();

    let elapsed = (record.end_time - record.start_time).to_std().ok();
    let (read, written) = conn_info.byte_counters();
    let moved = match direction {
        Direction::Download => written,
        Direction::Upload => read,
    };
    info!(
        "throughput1 {direction} stream {uuid} done ({terminal:?}): {moved} bytes, average {}",
        DataRate::new(moved, elapsed)
    );

    write_result(&*sink, direction, &uuid, &record);
}

fn write_result(
    sink: &dyn ResultSink,
    direction: Direction,
    uuid: &str,
    record: &Throughput1Result,
) {
    let value = match serde_json::to_value(record) {
        Ok(value) => value,
        Err(e) => {
            warn!("failed to serialize throughput1 result for {uuid}: {e}");
            return;
        }
    };
    if let Err(e) = sink.write("throughput1", &direction.to_string(), uuid, &value) {
        warn!("failed to write throughput1 result for {uuid}: {e}");
    }
}

fn bad_request() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    let _ = response
        .headers_mut()
        .insert(header::CONNECTION, header::HeaderValue::from_static("Close"));
    response
}

#[cfg(test)]
mod tests {
    use super::{RequestOptions, parse_options};
    use crate::access::parse_query;
    use crate::throughput1::DEFAULT_DURATION;
    use crate::throughput1::model::CcAlgorithm;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn parse(q: &str) -> Result<RequestOptions, String> {
        parse_options(&parse_query(Some(q)), "test".into())
    }

    #[test]
    fn minimal_valid_request() {
        let options = parse("mid=test&streams=2").unwrap();
        assert_eq!(options.mid, "test");
        assert_eq!(options.duration, DEFAULT_DURATION);
        assert_eq!(options.cc, None);
        assert_eq!(options.byte_limit, 0);
        assert_eq!(options.client_options.len(), 1);
        assert!(options.client_metadata.is_empty());
    }

    #[test]
    fn missing_streams_is_rejected() {
        let e = parse("mid=test").unwrap_err();
        assert!(e.contains("streams"));
    }

    #[test]
    fn duration_is_milliseconds() {
        let options = parse("streams=1&duration=500").unwrap();
        assert_eq!(options.duration, Duration::from_millis(500));
        let _ = parse("streams=1&duration=oops").unwrap_err();
        let _ = parse("streams=1&duration=-1").unwrap_err();
    }

    #[test]
    fn cc_is_validated() {
        let options = parse("streams=1&cc=bbr").unwrap();
        assert_eq!(options.cc, Some(CcAlgorithm::Bbr));
        let e = parse("streams=1&cc=invalid").unwrap_err();
        assert!(e.contains("not allowed"));
    }

    #[test]
    fn byte_limit_parses() {
        let options = parse("streams=1&bytes=150000").unwrap();
        assert_eq!(options.byte_limit, 150_000);
        let _ = parse("streams=1&bytes=nope").unwrap_err();
    }

    #[test]
    fn unknown_parameters_become_metadata() {
        let options = parse("streams=1&client_name=foo&client_version=1.2").unwrap();
        assert_eq!(options.client_metadata.len(), 2);
        assert_eq!(options.client_metadata[0].name, "client_name");
        assert_eq!(options.client_metadata[0].value, "foo");
    }

    #[test]
    fn oversized_metadata_is_rejected() {
        let long_value = "v".repeat(513);
        let _ = parse(&format!("streams=1&extra={long_value}")).unwrap_err();
        let long_key = "k".repeat(51);
        let _ = parse(&format!("streams=1&{long_key}=v")).unwrap_err();
    }

    #[test]
    fn options_are_echoed_in_order() {
        let options = parse("streams=1&duration=1000&cc=cubic&delay=50&bytes=42").unwrap();
        let names: Vec<&str> = options
            .client_options
            .iter()
            .map(|nv| nv.name.as_str())
            .collect();
        assert_eq!(names, vec!["streams", "duration", "cc", "delay", "bytes"]);
    }
}
