//! The throughput1 protocol: WebSocket bulk-transfer measurement streams
//!
//! One stream carries bulk binary frames in the measured direction and JSON
//! [`WireMeasurement`](model::WireMeasurement) text frames in both
//! directions, so each party continuously learns the other's view of the
//! transfer.
// (c) 2025 Ross Younger

use std::time::Duration;

pub mod handler;
pub mod model;
pub mod protocol;

/// Initial size of a binary WebSocket message.
pub const MIN_MESSAGE_SIZE: usize = 1 << 10;

/// Maximum size a binary WebSocket message scales up to. The 1 MiB value is a
/// good compromise between native and browser clients as seen in cloud-based
/// tests.
pub const MAX_SCALED_MESSAGE_SIZE: usize = 1 << 20;

/// Threshold divisor for scaling binary messages. When the current message
/// size is within 1/16th of the bytes sent so far, the message doubles:
/// small frames at the start of a stream give prompt first measurements and
/// keep the receiver responsive, larger frames once the stream has warmed up
/// sustain throughput.
pub const SCALING_FRACTION: u64 = 16;

/// Hard ceiling on the runtime of one stream, regardless of the duration the
/// client asked for.
pub const MAX_RUNTIME: Duration = Duration::from_secs(25);

/// Test duration applied when the client does not specify one.
pub const DEFAULT_DURATION: Duration = Duration::from_millis(5000);

/// Value of the Sec-WebSocket-Protocol header.
pub const SEC_WEBSOCKET_PROTOCOL: &str = "net.measurementlab.throughput.v1";

/// Selects the download subtest.
pub const DOWNLOAD_PATH: &str = "/throughput/v1/download";
/// Selects the upload subtest.
pub const UPLOAD_PATH: &str = "/throughput/v1/upload";
