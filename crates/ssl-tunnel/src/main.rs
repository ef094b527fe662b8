//! `ssl-tunnel` binary entry point.
//!
//! Startup sequence:
//! 1. Parse flags and load [`Config`] from flags, environment and defaults.
//! 2. Initialise structured JSON logging.
//! 3. Reuse or generate the key and self-signed certificate.
//! 4. Build the TLS server configuration from the persisted bundle.
//! 5. Bind the listener and proxy every request to the backend.

mod config;
mod credentials;
mod server;
mod telemetry;

use anyhow::Result;
use common::TunnelError;
use tracing::{error, info};

use crate::config::{Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let args = Args::parse_normalized();
    // Telemetry is not yet up; the error returned from `main` goes to stderr.
    let cfg = Config::load(&args)?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        wrap_port = cfg.wrap_port,
        serve_port = cfg.serve_port,
        "ssl-tunnel starting"
    );

    // -----------------------------------------------------------------------
    // 3. Credentials
    // -----------------------------------------------------------------------
    let paths = cfg.credential_paths();
    let provision = {
        let paths = paths.clone();
        let hosts = cfg.host_names();
        let organization = cfg.organization.clone();
        let policy = cfg.reuse_policy;
        tokio::task::spawn_blocking(move || {
            credentials::ensure_credentials(&paths, &hosts, &organization, policy)
        })
        .await?
    };
    if let Err(e) = provision {
        error!(error = %e, "credential provisioning failed");
        return Err(TunnelError::Provisioning(e.to_string()).into());
    }

    // -----------------------------------------------------------------------
    // 4. TLS
    // -----------------------------------------------------------------------
    let tls_config = server::tls::load_server_config(&paths).map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to load TLS credentials");
        TunnelError::Tls(format!("{e:#}"))
    })?;

    // -----------------------------------------------------------------------
    // 5. Proxy
    // -----------------------------------------------------------------------
    server::serve(&cfg, tls_config).await.map_err(|e| {
        error!(error = %format!("{e:#}"), "tunnel stopped");
        e
    })
}
