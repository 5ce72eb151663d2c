//! Server configuration
//!
//! Configuration is layered: built-in defaults, then `MSAK_`-prefixed
//! environment variables, then command-line options. The last writer wins.
// (c) 2025 Ross Younger

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

/// Prefix for configuration environment variables, e.g. `MSAK_WS_ADDR`.
const ENV_PREFIX: &str = "MSAK_";

/// The server's complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Listen endpoint for cleartext (`ws://`) connections.
    pub ws_addr: SocketAddr,
    /// Listen endpoint for TLS (`wss://`) connections. Only used when
    /// certificate material is configured.
    pub wss_addr: SocketAddr,
    /// Listen endpoint for latency measurements (UDP).
    pub latency_addr: SocketAddr,
    /// Directory to store measurement results in.
    pub datadir: PathBuf,
    /// Server certificate chain in PEM format.
    pub cert: Option<PathBuf>,
    /// Server private key in PEM format.
    pub key: Option<PathBuf>,
    /// How long a latency session stays available after authorization,
    /// in milliseconds.
    pub latency_ttl: u64,
    /// Whether to require verified access tokens.
    pub token_verify: bool,
    /// Public key for verifying access tokens.
    pub token_verify_key: Option<PathBuf>,
    /// Machine name to verify token claims against.
    pub token_machine: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ws_addr: sockaddr(8080),
            wss_addr: sockaddr(4443),
            latency_addr: sockaddr(1053),
            datadir: "./data".into(),
            cert: None,
            key: None,
            latency_ttl: crate::latency1::DEFAULT_SESSION_TTL.as_millis() as u64,
            token_verify: false,
            token_verify_key: None,
            token_machine: String::new(),
        }
    }
}

fn sockaddr(port: u16) -> SocketAddr {
    SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port)
}

impl Configuration {
    /// Resolves the configuration: defaults, environment, then the given
    /// overrides (normally the command line), and validates the result.
    pub fn load<T: Serialize>(overrides: &T) -> anyhow::Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides))
            .extract()
            .context("invalid configuration")?;
        config.validate()
    }

    /// Latency session TTL as a duration.
    #[must_use]
    pub fn latency_ttl(&self) -> Duration {
        Duration::from_millis(self.latency_ttl)
    }

    /// Sanity checks.
    pub fn validate(self) -> anyhow::Result<Self> {
        anyhow::ensure!(self.latency_ttl > 0, "latency_ttl must be positive");
        anyhow::ensure!(
            self.cert.is_some() == self.key.is_some(),
            "TLS operation requires both a certificate and a key"
        );
        Ok(self)
    }
}
