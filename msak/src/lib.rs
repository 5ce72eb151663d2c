// (c) 2025 Ross Younger

//! `msak` is a network measurement service. It runs two closely related
//! measurement protocols between a server and its clients:
//!
//! * **throughput1**, a multi-stream TCP/WebSocket throughput test which also
//!   reports kernel-level transport statistics while it runs;
//! * **latency1**, a UDP round-trip-time probe.
//!
//! Both protocols are bidirectional, time-bounded, and produce archival JSON
//! records suitable for downstream ingestion.
//!
//! ## Overview
//! - 🔬 Per-connection kernel metrics (`TCP_INFO`, BBR state) sampled at
//!   memoryless intervals, so measurements cannot alias against periodic
//!   network behaviour
//! - 🔁 Measurements are exchanged *in both directions* over the test stream,
//!   so each party archives its peer's view as well as its own
//! - 🧊 Optional TLS (`wss://`) operation with operator-provided certificates
//! - 🐧 Kernel introspection works on Linux; elsewhere the server still runs
//!   and simply omits the kernel metrics
//!
//! ## Protocol surface
//!
//! | Path | Purpose |
//! | ---  | ---     |
//! | `/throughput/v1/download` | WebSocket upgrade; server sends bulk data |
//! | `/throughput/v1/upload`   | WebSocket upgrade; client sends bulk data |
//! | `/latency/v1/authorize`   | create a latency session, returns the kickoff packet |
//! | `/latency/v1/result`      | return the summary for a cached session |
//!
//! The WebSocket subprotocol is `net.measurementlab.throughput.v1`. Latency
//! probes travel over UDP (default port 1053) as small JSON datagrams.

pub(crate) mod cli;
pub use cli::cli;

pub mod config;
pub use config::Configuration;

pub mod access;
pub mod latency1;
pub mod measurer;
pub mod net;
pub mod os;
pub mod results;
pub mod server;
pub mod throughput1;
pub mod util;

mod version;
