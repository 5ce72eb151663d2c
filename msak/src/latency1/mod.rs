//! The latency1 protocol: UDP round-trip-time probes
//!
//! A session is authorized over HTTP, kicked off by the client's first UDP
//! packet, probed by the server at memoryless intervals, and archived when it
//! falls out of the session cache.
// (c) 2025 Ross Younger

use std::time::Duration;

pub mod engine;
pub mod model;

/// How long the server keeps probing after the client's kickoff.
pub const SEND_DURATION: Duration = Duration::from_secs(5);

/// Minimum interval between probes.
pub const MIN_SEND_INTERVAL: Duration = Duration::from_millis(10);
/// Average interval between probes.
pub const AVG_SEND_INTERVAL: Duration = Duration::from_millis(25);
/// Maximum interval between probes.
pub const MAX_SEND_INTERVAL: Duration = Duration::from_millis(40);

/// How long a session stays in the cache before it is archived, unless
/// configured otherwise.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// Probe packets are small JSON documents; this comfortably bounds them.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Creates a latency session.
pub const AUTHORIZE_PATH: &str = "/latency/v1/authorize";
/// Returns the summary for a cached session.
pub const RESULT_PATH: &str = "/latency/v1/result";
