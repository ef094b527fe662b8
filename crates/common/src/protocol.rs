//! Response bodies the proxy produces itself.
//!
//! Successful responses are relayed from the backend untouched; only gateway
//! failures are rendered locally, as JSON.

use serde::{Deserialize, Serialize};

use crate::TunnelError;

/// Error body returned to a client when the proxy cannot reach the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_gateway"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&TunnelError> for ErrorResponse {
    fn from(err: &TunnelError) -> Self {
        let message = match err {
            TunnelError::BadGateway(_) => "the backend service could not be reached",
            TunnelError::GatewayTimeout(_) => "the backend service did not respond in time",
            _ => "internal proxy error",
        };
        Self::new(err.code(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_new() {
        let e = ErrorResponse::new("bad_gateway", "backend down");
        assert_eq!(e.code, "bad_gateway");
        assert!(e.message.contains("backend down"));
    }

    #[test]
    fn from_tunnel_error_hides_internal_detail() {
        let err = TunnelError::BadGateway("tcp connect error: 127.0.0.1:8080".into());
        let body = ErrorResponse::from(&err);
        assert_eq!(body.code, "bad_gateway");
        assert!(!body.message.contains("127.0.0.1"));
    }

    #[test]
    fn serialises_as_json_object() {
        let body = ErrorResponse::from(&TunnelError::GatewayTimeout("slow".into()));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "gateway_timeout");
    }
}
