//! Command-line argument definitions
// (c) 2025 Ross Younger

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;

/// Command-line options. Every configuration option here overrides its
/// `MSAK_*` environment variable, which in turn overrides the built-in
/// default; see [`Configuration`](crate::config::Configuration).
#[derive(Debug, Parser, Clone, Default, Serialize)]
#[command(author, version, about, infer_long_args(true))]
pub(crate) struct CliArgs {
    /// Listen address/port for cleartext connections
    #[arg(long, value_name("ADDR"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_addr: Option<SocketAddr>,

    /// Listen address/port for TLS connections
    #[arg(long, value_name("ADDR"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wss_addr: Option<SocketAddr>,

    /// Listen address/port for latency measurements (UDP)
    #[arg(long, value_name("ADDR"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_addr: Option<SocketAddr>,

    /// Directory to store measurement results in
    #[arg(long, value_name("DIR"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datadir: Option<PathBuf>,

    /// The file with server certificates in PEM format
    #[arg(long, value_name("FILE"), requires("key"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,

    /// The file with the server key in PEM format
    #[arg(long, value_name("FILE"), requires("cert"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,

    /// How long latency sessions remain available, in milliseconds
    #[arg(long, value_name("MS"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ttl: Option<u64>,

    /// Verify access tokens
    #[arg(long("token.verify"), action)]
    #[serde(rename = "token_verify", skip_serializing_if = "std::ops::Not::not")]
    pub token_verify: bool,

    /// Public key for verifying access tokens
    #[arg(long("token.verify-key"), value_name("FILE"))]
    #[serde(rename = "token_verify_key", skip_serializing_if = "Option::is_none")]
    pub token_verify_key: Option<PathBuf>,

    /// Use the given machine name to verify token claims
    #[arg(long("token.machine"), value_name("NAME"))]
    #[serde(rename = "token_machine", skip_serializing_if = "Option::is_none")]
    pub token_machine: Option<String>,

    /// Enable detailed debug output
    ///
    /// This has the same effect as setting `RUST_LOG=msak=debug` in the
    /// environment. If present, `RUST_LOG` overrides this option.
    #[arg(short, long, action, help_heading("Output"))]
    #[serde(skip)]
    pub debug: bool,

    /// Quiet mode: report only errors
    #[arg(short, long, action, conflicts_with("debug"), help_heading("Output"))]
    #[serde(skip)]
    pub quiet: bool,
}
