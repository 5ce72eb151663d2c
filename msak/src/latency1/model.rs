//! Data model for latency1 sessions, packets and archival records
// (c) 2025 Ross Younger

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::version;

/// Message direction of a [`LatencyPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// Client-to-server: the kickoff, and the shape of echoes the client
    /// would send in the reverse measurement.
    C2s,
    /// Server-to-client: a probe, or the client's echo of one.
    S2c,
}

/// The payload of one latency measurement UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyPacket {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: PacketKind,
    /// The measurement's unique identifier.
    pub id: String,
    /// Progressive sequence number.
    pub seq: usize,
    /// The previous RTT (microseconds) measured by the sender of this
    /// message, zero (and omitted) when there is none yet.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub last_rtt: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// One probe's outcome. A probe counts as lost until its echo arrives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTrip {
    /// Round-trip time, microseconds. Zero while the probe is outstanding.
    pub rtt: i64,
    /// Whether the echo is still missing.
    #[serde(default, skip_serializing_if = "is_false")]
    pub lost: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Send times and probe outcomes, indexed by sequence number and guarded
/// together: an entry is appended to both on every successful send.
#[derive(Debug, Default)]
struct ProbeLog {
    send_times: Vec<Instant>,
    round_trips: Vec<RoundTrip>,
}

/// In-memory state of one latency measurement session.
#[derive(Debug)]
pub struct Session {
    /// The measurement's unique identifier.
    pub id: String,
    /// When the session was authorized.
    pub start_time: DateTime<Utc>,
    /// When the session was evicted and archived.
    end_time: Mutex<Option<DateTime<Utc>>>,
    /// The client's endpoint, known once the kickoff arrives.
    client: OnceLock<SocketAddr>,
    /// The server's endpoint.
    server: OnceLock<SocketAddr>,
    /// Guards the once-per-session spawn of the send loop.
    started: Mutex<bool>,
    probes: Mutex<ProbeLog>,
    /// Last observed RTT, piggybacked onto outgoing probes.
    last_rtt: AtomicI64,
}

impl Session {
    /// An empty session for the given measurement id.
    #[must_use]
    pub fn new(id: String) -> Self {
        Self {
            id,
            start_time: Utc::now(),
            end_time: Mutex::new(None),
            client: OnceLock::new(),
            server: OnceLock::new(),
            started: Mutex::new(false),
            probes: Mutex::new(ProbeLog::default()),
            last_rtt: AtomicI64::new(0),
        }
    }

    /// Marks the session as started, recording the endpoints.
    ///
    /// Returns true on the first call only; the send loop must be spawned
    /// exactly once, by whoever got `true`.
    pub fn start(&self, client: SocketAddr, server: SocketAddr) -> bool {
        let mut started = self.started.lock().expect("session mutex poisoned");
        if *started {
            return false;
        }
        *started = true;
        let _ = self.client.set(client);
        let _ = self.server.set(server);
        true
    }

    /// The last observed RTT in microseconds, zero before the first echo.
    pub fn last_rtt(&self) -> i64 {
        self.last_rtt.load(Ordering::Relaxed)
    }

    /// Appends a successfully sent probe: its send time, and an outcome entry
    /// that stays `lost` until the matching echo arrives.
    pub fn record_send(&self, send_time: Instant) {
        let mut probes = self.probes.lock().expect("session mutex poisoned");
        probes.send_times.push(send_time);
        probes.round_trips.push(RoundTrip {
            rtt: 0,
            lost: true,
        });
    }

    /// Matches an echo against the recorded send time for its sequence
    /// number and stores the measured round-trip time.
    ///
    /// Returns the RTT in microseconds, or None for a sequence number we
    /// never sent.
    pub fn record_echo(&self, seq: usize, receive_time: Instant) -> Option<i64> {
        let mut probes = self.probes.lock().expect("session mutex poisoned");
        let send_time = probes.send_times.get(seq).copied()?;
        let rtt = i64::try_from(
            receive_time
                .saturating_duration_since(send_time)
                .as_micros(),
        )
        .unwrap_or(i64::MAX);
        self.last_rtt.store(rtt, Ordering::Relaxed);
        probes.round_trips[seq] = RoundTrip { rtt, lost: false };
        Some(rtt)
    }

    fn packets_received(round_trips: &[RoundTrip]) -> usize {
        round_trips.iter().filter(|rt| !rt.lost).count()
    }

    /// Projects this session into its `/result` summary.
    #[must_use]
    pub fn summarize(&self) -> Summary {
        let probes = self.probes.lock().expect("session mutex poisoned");
        Summary {
            id: self.id.clone(),
            start_time: self.start_time,
            round_trips: probes.round_trips.clone(),
            packets_sent: probes.send_times.len(),
            packets_received: Self::packets_received(&probes.round_trips),
        }
    }

    /// Projects this session into its archival record, recording its end.
    #[must_use]
    pub fn archive(&self, end_time: DateTime<Utc>) -> ArchivalData {
        *self.end_time.lock().expect("session mutex poisoned") = Some(end_time);
        let probes = self.probes.lock().expect("session mutex poisoned");
        ArchivalData {
            git_commit: version::git_commit().into(),
            version: version::short(),
            id: self.id.clone(),
            client: self.client.get().map(ToString::to_string).unwrap_or_default(),
            server: self.server.get().map(ToString::to_string).unwrap_or_default(),
            start_time: self.start_time,
            end_time,
            round_trips: probes.round_trips.clone(),
            packets_sent: probes.send_times.len(),
            packets_received: Self::packets_received(&probes.round_trips),
        }
    }
}

/// The `/result` projection of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// The measurement's unique identifier.
    pub id: String,
    /// When the session was authorized.
    pub start_time: DateTime<Utc>,
    /// Per-probe outcomes, indexed by sequence number.
    pub round_trips: Vec<RoundTrip>,
    /// Number of probes sent so far.
    pub packets_sent: usize,
    /// Number of echoes received so far.
    pub packets_received: usize,
}

/// The archival projection of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalData {
    /// Git commit (short form) of the running server code.
    pub git_commit: String,
    /// Symbolic version of the running server code.
    pub version: String,
    /// The measurement's unique identifier.
    pub id: String,
    /// The client's ip:port pair, empty if the kickoff never arrived.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client: String,
    /// The server's ip:port pair.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// When the session was authorized.
    pub start_time: DateTime<Utc>,
    /// When the session was evicted. The protocol has no explicit
    /// termination message, so this is set at eviction time.
    pub end_time: DateTime<Utc>,
    /// Per-probe outcomes, indexed by sequence number.
    pub round_trips: Vec<RoundTrip>,
    /// Number of probes sent.
    pub packets_sent: usize,
    /// Number of echoes received.
    pub packets_received: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn packet_roundtrip_and_omitted_zero() {
        let kickoff = LatencyPacket {
            kind: PacketKind::C2s,
            id: "t".into(),
            seq: 0,
            last_rtt: 0,
        };
        let encoded = serde_json::to_string(&kickoff).unwrap();
        assert_eq!(encoded, r#"{"type":"c2s","id":"t","seq":0}"#);
        let decoded: LatencyPacket = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, kickoff);

        let probe = LatencyPacket {
            kind: PacketKind::S2c,
            id: "t".into(),
            seq: 3,
            last_rtt: 1500,
        };
        let decoded: LatencyPacket =
            serde_json::from_str(&serde_json::to_string(&probe).unwrap()).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn lost_flag_is_omitted_when_false() {
        let rt = RoundTrip { rtt: 42, lost: false };
        assert_eq!(serde_json::to_string(&rt).unwrap(), r#"{"rtt":42}"#);
        let rt = RoundTrip { rtt: 0, lost: true };
        assert_eq!(serde_json::to_string(&rt).unwrap(), r#"{"rtt":0,"lost":true}"#);
    }

    #[tokio::test]
    async fn echo_accounting() {
        let session = Session::new("t".into());
        let t0 = Instant::now();
        session.record_send(t0);
        session.record_send(t0 + Duration::from_millis(30));

        // Echo for an unknown sequence number is rejected.
        assert_eq!(session.record_echo(2, t0), None);

        let rtt = session
            .record_echo(0, t0 + Duration::from_millis(10))
            .unwrap();
        assert_eq!(rtt, 10_000);
        assert_eq!(session.last_rtt(), 10_000);

        let summary = session.summarize();
        assert_eq!(summary.packets_sent, 2);
        assert_eq!(summary.packets_received, 1);
        assert_eq!(summary.round_trips[0], RoundTrip { rtt: 10_000, lost: false });
        assert!(summary.round_trips[1].lost);
    }

    #[tokio::test]
    async fn start_happens_once() {
        let session = Session::new("t".into());
        let client = "127.0.0.1:9999".parse().unwrap();
        let server = "127.0.0.1:1053".parse().unwrap();
        assert!(session.start(client, server));
        assert!(!session.start(client, server));
        let archive = session.archive(Utc::now());
        assert_eq!(archive.client, "127.0.0.1:9999");
        assert_eq!(archive.server, "127.0.0.1:1053");
    }

    #[tokio::test]
    async fn archive_counts() {
        let session = Session::new("t".into());
        let t0 = Instant::now();
        for i in 0..5 {
            session.record_send(t0 + Duration::from_millis(i * 25));
        }
        let _ = session.record_echo(1, t0 + Duration::from_millis(40)).unwrap();
        let _ = session.record_echo(3, t0 + Duration::from_millis(90)).unwrap();

        let archive = session.archive(Utc::now());
        assert_eq!(archive.packets_sent, 5);
        assert_eq!(archive.packets_received, 2);
        assert_eq!(archive.round_trips.len(), 5);
        for rt in &archive.round_trips {
            if !rt.lost {
                assert!(rt.rtt > 0);
            }
        }
    }
}
