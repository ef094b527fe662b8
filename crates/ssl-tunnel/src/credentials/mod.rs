//! Credential bundle provisioning: generate-if-absent, persist, reuse.
//!
//! # Lifecycle
//!
//! 1. At startup, [`ensure_credentials`] checks the key and certificate paths.
//! 2. If both exist the bundle is reused. Under [`ReusePolicy::Presence`] the
//!    files are not even read; under [`ReusePolicy::Validated`] they must load
//!    into a TLS server config or they are regenerated.
//! 3. Otherwise a new RSA key and self-signed certificate are generated and
//!    written together, replacing any file already present at either path.
//!
//! The process never deletes or rotates a bundle once written.
//!
//! # Security invariants
//!
//! - The key file is created with mode `0600`.
//! - Key material is never logged.

pub mod generate;
pub mod store;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::server::tls;

/// Errors produced while generating or persisting a bundle. All are fatal.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The RSA key pair could not be generated.
    #[error("failed to generate RSA private key: {0}")]
    KeyGeneration(String),

    /// The certificate could not be built or self-signed.
    #[error("failed to create certificate: {0}")]
    Certificate(#[from] rcgen::Error),

    /// Key material could not be PEM encoded.
    #[error("failed to encode {0}")]
    Encoding(String),

    /// A credential file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// When an existing pair of credential files may be reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReusePolicy {
    /// Reuse whenever both files exist, without reading them.
    #[default]
    Presence,
    /// Reuse only if both files load into a TLS server config.
    Validated,
}

/// Locations of the persisted key and certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
}

impl CredentialPaths {
    fn both_exist(&self) -> bool {
        self.key.exists() && self.cert.exists()
    }
}

/// What [`ensure_credentials`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Existing files were left untouched.
    Reused,
    /// A new bundle was written.
    Generated { serial: u64 },
}

/// Make sure a usable key and certificate exist at `paths`.
///
/// # Errors
///
/// Returns a [`ProvisionError`] if a bundle had to be generated and generation
/// or writing failed. Nothing is retried.
pub fn ensure_credentials(
    paths: &CredentialPaths,
    hosts: &[String],
    organization: &str,
    policy: ReusePolicy,
) -> Result<ProvisionOutcome, ProvisionError> {
    if paths.both_exist() {
        match policy {
            ReusePolicy::Presence => {
                info!(cert = %paths.cert.display(), key = %paths.key.display(), "using existing key and certificate");
                return Ok(ProvisionOutcome::Reused);
            }
            ReusePolicy::Validated => match check_loadable(paths) {
                Ok(()) => {
                    info!(cert = %paths.cert.display(), key = %paths.key.display(), "using existing validated key and certificate");
                    return Ok(ProvisionOutcome::Reused);
                }
                Err(e) => warn!(error = %format!("{e:#}"), "existing credentials are unusable; regenerating"),
            },
        }
    } else {
        info!(
            key_present = paths.key.exists(),
            cert_present = paths.cert.exists(),
            "credentials incomplete; generating"
        );
    }

    info!(bits = generate::RSA_KEY_BITS, "generating private key and self-signed certificate");
    let bundle = generate::generate(hosts, organization, OffsetDateTime::now_utc())?;
    store::persist(paths, &bundle)?;
    info!(
        serial = bundle.serial,
        hosts = ?hosts,
        cert = %paths.cert.display(),
        key = %paths.key.display(),
        "wrote new key and self-signed certificate"
    );
    Ok(ProvisionOutcome::Generated {
        serial: bundle.serial,
    })
}

fn check_loadable(paths: &CredentialPaths) -> anyhow::Result<()> {
    let cert = read(&paths.cert)?;
    let key = read(&paths.key)?;
    tls::build_server_config(&cert, &key)?;
    Ok(())
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}
