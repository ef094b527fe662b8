//! Common error types shared across crates.

use thiserror::Error;

/// Top-level tunnel error type.
///
/// Startup variants are fatal and terminate the process. Per-request variants
/// map to the HTTP status returned to the one affected client:
/// - [`TunnelError::BadGateway`] → 502
/// - [`TunnelError::GatewayTimeout`] → 504
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The credential bundle could not be generated or persisted.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// A configuration value is missing or malformed.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The listening socket could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(String),

    /// The TLS server configuration could not be built from the bundle.
    #[error("tls setup failed: {0}")]
    Tls(String),

    /// The backend refused the connection or the round trip failed.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// The backend did not answer within the configured deadline.
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),
}

impl TunnelError {
    /// Returns the HTTP status code that should be sent for this error.
    ///
    /// Startup errors never reach a client; they report 500 for completeness.
    pub fn http_status(&self) -> u16 {
        match self {
            TunnelError::BadGateway(_) => 502,
            TunnelError::GatewayTimeout(_) => 504,
            TunnelError::Provisioning(_)
            | TunnelError::Configuration(_)
            | TunnelError::Bind(_)
            | TunnelError::Tls(_) => 500,
        }
    }

    /// Short machine-readable code used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::Provisioning(_) => "provisioning_failed",
            TunnelError::Configuration(_) => "invalid_configuration",
            TunnelError::Bind(_) => "bind_failed",
            TunnelError::Tls(_) => "tls_failed",
            TunnelError::BadGateway(_) => "bad_gateway",
            TunnelError::GatewayTimeout(_) => "gateway_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(TunnelError::BadGateway("x".into()).http_status(), 502);
        assert_eq!(TunnelError::GatewayTimeout("x".into()).http_status(), 504);
        assert_eq!(TunnelError::Bind("x".into()).http_status(), 500);
    }

    #[test]
    fn display_includes_message() {
        let e = TunnelError::BadGateway("connection refused".into());
        assert!(e.to_string().contains("connection refused"));
        assert_eq!(e.code(), "bad_gateway");
    }
}
