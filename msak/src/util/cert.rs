//! TLS credential loading
// (c) 2025 Ross Younger

use std::{fs::File, io::BufReader, path::Path};

use anyhow::Context as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Reads a PEM certificate chain and private key from disk and builds a
/// rustls server configuration for the `wss://` listener.
pub(crate) fn load_tls_config(cert: &Path, key: &Path) -> anyhow::Result<ServerConfig> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert).with_context(
            || format!("failed to open certificate file {}", cert.display()),
        )?))
        .collect::<Result<_, _>>()
        .context("failed to parse certificate file")?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in {}", cert.display());

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key).with_context(|| format!("failed to open key file {}", key.display()))?,
    ))
    .context("failed to parse key file")?
    .with_context(|| format!("no private key found in {}", key.display()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::load_tls_config;
    use std::path::Path;

    #[test]
    fn missing_files_are_reported() {
        let e = load_tls_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert!(format!("{e:#}").contains("certificate"));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        use std::io::Write as _;
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        write!(std::fs::File::create(&cert).unwrap(), "not a pem").unwrap();
        write!(std::fs::File::create(&key).unwrap(), "not a pem").unwrap();
        let _ = load_tls_config(&cert, &key).unwrap_err();
    }
}
