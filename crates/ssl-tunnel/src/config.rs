//! Configuration loading and validation.
//!
//! Values are layered: built-in defaults, then `SSL_TUNNEL_*` environment
//! variables, then command-line flags. The result is an immutable [`Config`]
//! built once at startup and passed by reference to the provisioner and the
//! proxy.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use common::TunnelError;
use hyper::Uri;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::credentials::{CredentialPaths, ReusePolicy};

/// Prefix for environment variable overrides, e.g. `SSL_TUNNEL_WRAP_PORT`.
pub const ENV_PREFIX: &str = "SSL_TUNNEL";

/// Command-line flags. Every flag is optional; unset flags fall back to the
/// environment and then to the defaults in [`Config`].
#[derive(Debug, Default, Parser)]
#[command(
    name = "ssl-tunnel",
    version,
    about = "Wrap a local HTTP service with a self-signed TLS reverse proxy"
)]
pub struct Args {
    /// The local port to wrap with TLS.
    #[arg(long = "wrap", value_name = "PORT")]
    pub wrap: Option<u16>,

    /// The port to serve TLS on.
    #[arg(long = "serve", value_name = "PORT")]
    pub serve: Option<u16>,

    /// A comma separated list of hostnames to embed in the certificate.
    #[arg(long, value_name = "HOSTS")]
    pub hosts: Option<String>,

    /// Address to bind the TLS listener to.
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<IpAddr>,

    /// Host of the wrapped backend service.
    #[arg(long, value_name = "HOST")]
    pub backend_host: Option<String>,

    /// Path of the PEM certificate file.
    #[arg(long, value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// Path of the PEM private key file.
    #[arg(long, value_name = "PATH")]
    pub key: Option<PathBuf>,

    /// Organization name written into a newly generated certificate.
    #[arg(long, value_name = "NAME")]
    pub organization: Option<String>,

    /// When existing credential files may be reused.
    #[arg(long, value_enum)]
    pub reuse_policy: Option<ReusePolicy>,

    /// Deadline for the TLS handshake. Unbounded when unset.
    #[arg(long, value_name = "SECS")]
    pub handshake_timeout_secs: Option<u64>,

    /// Deadline for the backend to answer a forwarded request. Unbounded when unset.
    #[arg(long, value_name = "SECS")]
    pub backend_timeout_secs: Option<u64>,

    /// Deadline for a client to send its request head. Unbounded when unset.
    #[arg(long, value_name = "SECS")]
    pub client_header_timeout_secs: Option<u64>,

    /// Maximum number of concurrently served connections. Unbounded when unset.
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Replace the client's Host header with the backend authority.
    #[arg(long)]
    pub rewrite_host: bool,

    /// Tracing log level (overridden by `RUST_LOG`).
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Args {
    /// Parse flags from the process arguments, accepting single-dash long
    /// flags (`-wrap 8080`) as well as the double-dash form.
    pub fn parse_normalized() -> Self {
        Self::parse_from(normalize_args(std::env::args()))
    }
}

/// Rewrites single-dash long flags (`-serve`, `-hosts=a,b`) to their
/// double-dash form. Unknown flags and positional values are left alone.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let command = Args::command();
    let longs: Vec<&str> = command
        .get_arguments()
        .filter_map(|a| a.get_long())
        .collect();

    args.into_iter()
        .map(|arg| {
            let Some(rest) = arg.strip_prefix('-') else {
                return arg;
            };
            if rest.starts_with('-') || rest.len() < 2 {
                return arg;
            }
            let name = rest.split_once('=').map_or(rest, |(n, _)| n);
            if longs.contains(&name) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

/// Validated tunnel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Local port of the plaintext backend.
    #[serde(default = "default_wrap_port")]
    pub wrap_port: u16,

    /// Port the TLS listener binds to. `0` picks an ephemeral port.
    #[serde(default = "default_serve_port")]
    pub serve_port: u16,

    /// Comma separated DNS names for the certificate.
    #[serde(default = "default_hosts")]
    pub hosts: String,

    /// Address the TLS listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Host of the backend origin.
    #[serde(default = "default_backend_host")]
    pub backend_host: String,

    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Subject organization of generated certificates.
    #[serde(default = "default_organization")]
    pub organization: String,

    #[serde(default)]
    pub reuse_policy: ReusePolicy,

    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,

    #[serde(default)]
    pub backend_timeout_secs: Option<u64>,

    #[serde(default)]
    pub client_header_timeout_secs: Option<u64>,

    /// Admission limit for concurrent connections.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Send the backend authority as `Host` instead of the client's value.
    #[serde(default)]
    pub rewrite_host: bool,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_wrap_port() -> u16 {
    80
}
fn default_serve_port() -> u16 {
    443
}
fn default_hosts() -> String {
    "localhost".into()
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_backend_host() -> String {
    "127.0.0.1".into()
}
fn default_cert_path() -> PathBuf {
    PathBuf::from("cert")
}
fn default_key_path() -> PathBuf {
    PathBuf::from("key")
}
fn default_organization() -> String {
    "Super Secure Widgets Co.".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from the environment and `args`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be parsed or fails validation.
    pub fn load(args: &Args) -> Result<Self> {
        Self::from_sources(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
            args,
        )
    }

    fn from_sources(env: config::Environment, args: &Args) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(env)
            .build()
            .context("failed to build configuration")?;

        let mut c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.apply_args(args);
        c.validate()?;
        Ok(c)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(port) = args.wrap {
            self.wrap_port = port;
        }
        if let Some(port) = args.serve {
            self.serve_port = port;
        }
        if let Some(hosts) = &args.hosts {
            self.hosts = hosts.clone();
        }
        if let Some(addr) = args.bind {
            self.bind_address = addr;
        }
        if let Some(host) = &args.backend_host {
            self.backend_host = host.clone();
        }
        if let Some(path) = &args.cert {
            self.cert_path = path.clone();
        }
        if let Some(path) = &args.key {
            self.key_path = path.clone();
        }
        if let Some(org) = &args.organization {
            self.organization = org.clone();
        }
        if let Some(policy) = args.reuse_policy {
            self.reuse_policy = policy;
        }
        if args.handshake_timeout_secs.is_some() {
            self.handshake_timeout_secs = args.handshake_timeout_secs;
        }
        if args.backend_timeout_secs.is_some() {
            self.backend_timeout_secs = args.backend_timeout_secs;
        }
        if args.client_header_timeout_secs.is_some() {
            self.client_header_timeout_secs = args.client_header_timeout_secs;
        }
        if args.max_connections.is_some() {
            self.max_connections = args.max_connections;
        }
        if args.rewrite_host {
            self.rewrite_host = true;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<(), TunnelError> {
        if self.wrap_port == 0 {
            return Err(TunnelError::Configuration(
                "wrap port must be non-zero".into(),
            ));
        }
        if self.host_names().is_empty() || self.hosts.split(',').any(|h| h.trim().is_empty()) {
            return Err(TunnelError::Configuration(format!(
                "hosts must be a comma separated list of non-empty names, got {:?}",
                self.hosts
            )));
        }
        ensure_positive(self.handshake_timeout_secs, "handshake timeout")?;
        ensure_positive(self.backend_timeout_secs, "backend timeout")?;
        ensure_positive(self.client_header_timeout_secs, "client header timeout")?;
        if let Some(n) = self.max_connections {
            if n == 0 || n > Semaphore::MAX_PERMITS {
                return Err(TunnelError::Configuration(format!(
                    "max connections must be between 1 and {} when set, got {n}",
                    Semaphore::MAX_PERMITS
                )));
            }
        }
        self.backend_origin()?;
        Ok(())
    }

    /// DNS names for the certificate, split on commas, in order.
    pub fn host_names(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Socket address the TLS listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.serve_port)
    }

    /// The single backend origin every request is forwarded to.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] if the backend host and port do
    /// not form a valid `http://` origin.
    pub fn backend_origin(&self) -> Result<Uri, TunnelError> {
        let host = self.backend_host.trim();
        if host.is_empty() {
            return Err(TunnelError::Configuration(
                "backend host must not be empty".into(),
            ));
        }
        let authority = match host.parse::<Ipv6Addr>() {
            Ok(v6) => format!("[{v6}]:{}", self.wrap_port),
            Err(_) => format!("{host}:{}", self.wrap_port),
        };
        let uri: Uri = format!("http://{authority}/").parse().map_err(|e| {
            TunnelError::Configuration(format!("invalid backend origin {authority}: {e}"))
        })?;
        if uri.path() != "/" || uri.query().is_some() {
            return Err(TunnelError::Configuration(format!(
                "backend host {host:?} must not contain a path"
            )));
        }
        Ok(uri)
    }

    pub fn credential_paths(&self) -> CredentialPaths {
        CredentialPaths {
            key: self.key_path.clone(),
            cert: self.cert_path.clone(),
        }
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    pub fn backend_timeout(&self) -> Option<Duration> {
        self.backend_timeout_secs.map(Duration::from_secs)
    }

    pub fn client_header_timeout(&self) -> Option<Duration> {
        self.client_header_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wrap_port: default_wrap_port(),
            serve_port: default_serve_port(),
            hosts: default_hosts(),
            bind_address: default_bind_address(),
            backend_host: default_backend_host(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            organization: default_organization(),
            reuse_policy: ReusePolicy::default(),
            handshake_timeout_secs: None,
            backend_timeout_secs: None,
            client_header_timeout_secs: None,
            max_connections: None,
            rewrite_host: false,
            log_level: default_log_level(),
        }
    }
}

fn ensure_positive(value: Option<u64>, name: &str) -> Result<(), TunnelError> {
    if value == Some(0) {
        return Err(TunnelError::Configuration(format!(
            "{name} must be > 0 when set"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .source(Some(map))
    }

    fn args(argv: &[&str]) -> Args {
        let argv = std::iter::once("ssl-tunnel")
            .chain(argv.iter().copied())
            .map(str::to_owned);
        Args::parse_from(normalize_args(argv))
    }

    #[test]
    fn defaults_are_correct() {
        let cfg = Config::from_sources(env(&[]), &Args::default()).unwrap();
        assert_eq!(cfg.wrap_port, 80);
        assert_eq!(cfg.serve_port, 443);
        assert_eq!(cfg.host_names(), vec!["localhost"]);
        assert_eq!(cfg.listen_addr().to_string(), "0.0.0.0:443");
        assert_eq!(cfg.backend_origin().unwrap().to_string(), "http://127.0.0.1:80/");
        assert_eq!(cfg.cert_path, PathBuf::from("cert"));
        assert_eq!(cfg.key_path, PathBuf::from("key"));
        assert_eq!(cfg.reuse_policy, ReusePolicy::Presence);
        assert!(cfg.handshake_timeout().is_none());
        assert!(cfg.backend_timeout().is_none());
        assert!(cfg.max_connections.is_none());
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn single_dash_flags_are_accepted() {
        let a = args(&["-wrap", "8080", "-serve", "8443", "-hosts=a.test,b.test"]);
        assert_eq!(a.wrap, Some(8080));
        assert_eq!(a.serve, Some(8443));
        assert_eq!(a.hosts.as_deref(), Some("a.test,b.test"));
    }

    #[test]
    fn normalize_leaves_unknown_and_values_alone() {
        let out = normalize_args(
            ["ssl-tunnel", "-x", "-bogus", "--serve", "-1"]
                .iter()
                .map(|s| s.to_string()),
        );
        assert_eq!(out, vec!["ssl-tunnel", "-x", "-bogus", "--serve", "-1"]);
    }

    #[test]
    fn flags_override_environment() {
        let cfg = Config::from_sources(
            env(&[("SSL_TUNNEL_WRAP_PORT", "3000"), ("SSL_TUNNEL_SERVE_PORT", "9443")]),
            &args(&["--wrap", "8080"]),
        )
        .unwrap();
        assert_eq!(cfg.wrap_port, 8080);
        assert_eq!(cfg.serve_port, 9443);
    }

    #[test]
    fn host_list_preserves_order() {
        let cfg = Config::from_sources(env(&[]), &args(&["--hosts", "b.test,a.test,c.test"]))
            .unwrap();
        assert_eq!(cfg.host_names(), vec!["b.test", "a.test", "c.test"]);
    }

    #[test]
    fn validate_rejects_empty_host_entry() {
        let cfg = Config {
            hosts: "a.test,,b.test".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_wrap_port() {
        let cfg = Config {
            wrap_port: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeouts_and_limits() {
        let cfg = Config {
            backend_timeout_secs: Some(0),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            max_connections: Some(0),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            max_connections: Some(usize::MAX),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(TunnelError::Configuration(_))));

        let cfg = Config {
            max_connections: Some(Semaphore::MAX_PERMITS),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_serve_port_is_accepted() {
        let cfg = Config {
            serve_port: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn malformed_backend_host_is_a_configuration_error() {
        let cfg = Config {
            backend_host: "bad host/with path".into(),
            ..Config::default()
        };
        assert!(matches!(
            cfg.backend_origin(),
            Err(TunnelError::Configuration(_))
        ));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ipv6_backend_host_is_bracketed() {
        let cfg = Config {
            backend_host: "::1".into(),
            wrap_port: 8080,
            ..Config::default()
        };
        assert_eq!(cfg.backend_origin().unwrap().to_string(), "http://[::1]:8080/");
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(Config::default().validate().is_ok());
    }
}
