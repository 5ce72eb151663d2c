//! Data model for throughput1 measurements and archival records
// (c) 2025 Ross Younger

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de};
use strum::VariantNames;

use crate::os;

/// A snapshot of one stream's counters and kernel metrics at one instant.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Microseconds since the measurer started observing this stream.
    pub elapsed_microseconds: u64,

    /// Application-level bytes sent over this stream so far, as observed by
    /// the party taking this Measurement.
    pub application_bytes_sent: u64,

    /// Application-level bytes received over this stream so far.
    pub application_bytes_received: u64,

    /// Congestion-control metrics. Only present when the sender's active
    /// algorithm is BBR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc_info: Option<os::CcInfo>,

    /// Transport-layer kernel metrics. Only present when the party taking
    /// this Measurement has access to them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<TcpInfo>,
}

/// The kernel transport snapshot embedded in a [`Measurement`], with its own
/// elapsed time relative to the connection's accept time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TcpInfo {
    /// The kernel's view of this connection.
    #[serde(flatten)]
    pub kernel: os::TcpInfo,
    /// Microseconds between the connection's accept time and this snapshot.
    pub elapsed_microseconds: u64,
}

/// The envelope for [`Measurement`]s exchanged over the WebSocket as JSON
/// text frames.
///
/// Every field except `measurement` identifies the stream rather than the
/// instant, and is only expected to be non-empty in the first message sent in
/// each direction.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMeasurement {
    /// Congestion control algorithm used by the sender of this message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cc_algorithm: String,
    /// Unique identifier of this stream.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    /// The sender's endpoint (ip:port).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_address: String,
    /// The receiver's endpoint (ip:port), as seen by the sender.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_address: String,
    /// The wrapped measurement.
    pub measurement: Measurement,
}

/// Direction of a throughput1 subtest.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The server sends bulk data.
    Download,
    /// The client sends bulk data.
    Upload,
}

/// Congestion control algorithms a client may request.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
    Serialize,
)]
#[strum(serialize_all = "lowercase")] // N.B. this applies to EnumString, not Display
pub enum CcAlgorithm {
    /// Classic Reno.
    Reno,
    /// The kernel's usual default.
    #[default]
    Cubic,
    /// Model-based; reports bandwidth and min-RTT estimates while active.
    Bbr,
}

impl<'de> Deserialize<'de> for CcAlgorithm {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let lower = s.to_ascii_lowercase();
        // requires strum::EnumString && strum::VariantNames && #[strum(serialize_all = "lowercase")]
        FromStr::from_str(&lower).map_err(|_| de::Error::unknown_variant(&s, CcAlgorithm::VARIANTS))
    }
}

/// A name/value pair, BigQuery-compatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    /// Option or metadata key.
    pub name: String,
    /// Its verbatim value.
    pub value: String,
}

/// The archival record for one throughput1 stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Throughput1Result {
    /// Git commit (short form) of the running server code.
    pub git_commit: String,
    /// Symbolic version of the running server code.
    pub version: String,
    /// Test direction.
    pub direction: Direction,
    /// Identifier grouping multiple streams into one measurement.
    pub measurement_id: String,
    /// Unique identifier of this stream.
    pub uuid: String,
    /// The server's endpoint (ip:port).
    pub server: String,
    /// The client's endpoint (ip:port).
    pub client: String,
    /// Congestion control algorithm used by the data sender of this stream,
    /// as actually reported by its kernel.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cc_algorithm: String,
    /// When the stream started. Does not include connection setup time.
    pub start_time: DateTime<Utc>,
    /// When the stream ended.
    pub end_time: DateTime<Utc>,
    /// Measurements taken by the server, in emission order.
    pub server_measurements: Vec<Measurement>,
    /// Measurements taken by the client, echoed back over the wire, in
    /// arrival order.
    pub client_measurements: Vec<Measurement>,
    /// Recognized querystring options, verbatim.
    pub client_options: Vec<NameValue>,
    /// Everything else the client put in the querystring, verbatim.
    pub client_metadata: Vec<NameValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_measurement_roundtrip() {
        let wm = WireMeasurement {
            cc_algorithm: "bbr".into(),
            uuid: "abcd".into(),
            local_address: "127.0.0.1:1".into(),
            remote_address: "127.0.0.1:2".into(),
            measurement: Measurement {
                elapsed_microseconds: 150_000,
                application_bytes_sent: 1024,
                ..Default::default()
            },
        };
        let encoded = serde_json::to_string(&wm).unwrap();
        let decoded: WireMeasurement = serde_json::from_str(&encoded).unwrap();
        assert_eq!(wm, decoded);
    }

    #[test]
    fn empty_identity_fields_are_elided() {
        let wm = WireMeasurement {
            measurement: Measurement {
                elapsed_microseconds: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let v = serde_json::to_value(&wm).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("cc_algorithm"));
        assert!(!obj.contains_key("uuid"));
        assert!(!obj.contains_key("local_address"));
        assert!(!obj.contains_key("remote_address"));
        assert_eq!(v["measurement"]["elapsed_microseconds"], 1);
    }

    #[test]
    fn cc_algorithm_parsing() {
        assert_eq!("bbr".parse::<CcAlgorithm>().unwrap(), CcAlgorithm::Bbr);
        assert_eq!("cubic".parse::<CcAlgorithm>().unwrap(), CcAlgorithm::Cubic);
        assert_eq!("reno".parse::<CcAlgorithm>().unwrap(), CcAlgorithm::Reno);
        assert!("vegas".parse::<CcAlgorithm>().is_err());
        assert_eq!(CcAlgorithm::Bbr.to_string(), "bbr");
    }

    #[test]
    fn direction_strings() {
        assert_eq!(Direction::Download.to_string(), "download");
        assert_eq!(
            serde_json::to_value(Direction::Upload).unwrap(),
            serde_json::json!("upload")
        );
    }
}
