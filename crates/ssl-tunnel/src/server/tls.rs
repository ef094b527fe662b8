//! TLS server configuration built from the persisted credential bundle.

use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use rustls::{crypto::ring, ServerConfig};

use crate::credentials::CredentialPaths;

/// Read the bundle at `paths` and build a [`rustls::ServerConfig`] from it.
///
/// # Errors
///
/// Returns an error if either file cannot be read or parsed.
pub fn load_server_config(paths: &CredentialPaths) -> Result<Arc<ServerConfig>> {
    let cert_pem = fs::read(&paths.cert)
        .with_context(|| format!("failed to read certificate {}", paths.cert.display()))?;
    let key_pem = fs::read(&paths.key)
        .with_context(|| format!("failed to read private key {}", paths.key.display()))?;
    build_server_config(&cert_pem, &key_pem)
}

/// Build a [`rustls::ServerConfig`] from PEM-encoded certificate and private key bytes.
///
/// Only HTTP/1.1 is advertised over ALPN.
///
/// # Errors
///
/// Returns an error if the certificate or key cannot be parsed, or if rustls
/// rejects the configuration.
pub fn build_server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse TLS certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in PEM data");
    }

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
        .context("failed to read TLS private key")?
        .context("no private key found in PEM data")?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build rustls ServerConfig")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
