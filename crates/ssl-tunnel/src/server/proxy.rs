//! Single-backend reverse proxy handler.
//!
//! Every request, whatever its path or `Host`, goes to the one [`ProxyRoute`]
//! fixed at startup. Method, path, query, body and end-to-end headers are
//! forwarded unchanged; the backend's status, headers and body are streamed
//! back. Backend failures become a JSON 502 (or 504 on deadline) for that one
//! client only.

use std::{convert::Infallible, error::Error as StdError, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use common::{protocol::ErrorResponse, TunnelError};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE, HOST},
    http::uri::{Authority, PathAndQuery, Scheme},
    Request, Response, StatusCode, Uri, Version,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tracing::{debug, warn};

use super::headers;
use crate::config::Config;

/// Body type for everything the proxy sends or relays.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

type BackendClient = Client<HttpConnector, ProxyBody>;

/// The one backend origin all traffic is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    scheme: Scheme,
    authority: Authority,
}

impl ProxyRoute {
    /// Build a route from an absolute `http://host:port` origin.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] if `origin` lacks a scheme or
    /// authority.
    pub fn new(origin: &Uri) -> Result<Self, TunnelError> {
        let scheme = origin.scheme().cloned().ok_or_else(|| {
            TunnelError::Configuration(format!("backend origin {origin} has no scheme"))
        })?;
        let authority = origin.authority().cloned().ok_or_else(|| {
            TunnelError::Configuration(format!("backend origin {origin} has no authority"))
        })?;
        Ok(Self { scheme, authority })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Map an inbound request target onto the backend origin.
    pub fn target(&self, inbound: &Uri) -> Result<Uri, TunnelError> {
        let path_and_query = inbound
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| TunnelError::BadGateway(format!("failed to build backend uri: {e}")))
    }
}

impl std::fmt::Display for ProxyRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Reverse proxy bound permanently to one [`ProxyRoute`].
///
/// Cheap to clone: the route is shared and the client's pool is reference
/// counted.
#[derive(Clone)]
pub struct ReverseProxy {
    route: Arc<ProxyRoute>,
    client: BackendClient,
    backend_timeout: Option<Duration>,
    rewrite_host: bool,
}

impl ReverseProxy {
    pub fn new(route: ProxyRoute, backend_timeout: Option<Duration>, rewrite_host: bool) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            route: Arc::new(route),
            client,
            backend_timeout,
            rewrite_host,
        }
    }

    /// Build the proxy described by `cfg`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] if the backend origin is malformed.
    pub fn from_config(cfg: &Config) -> Result<Self, TunnelError> {
        let route = ProxyRoute::new(&cfg.backend_origin()?)?;
        Ok(Self::new(route, cfg.backend_timeout(), cfg.rewrite_host))
    }

    pub fn route(&self) -> &ProxyRoute {
        &self.route
    }

    /// Forward one request, converting any backend failure into a gateway
    /// error response.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        match self.forward(req, peer).await {
            Ok(resp) => {
                debug!(%peer, %method, path = %path, status = resp.status().as_u16(), "proxied");
                Ok(resp)
            }
            Err(err) => {
                warn!(%peer, %method, path = %path, backend = %self.route, error = %err, "proxy error");
                Ok(error_response(&err))
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, TunnelError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.route.target(&parts.uri)?;
        parts.version = Version::HTTP_11;
        headers::prepare_request(&mut parts.headers, peer.ip());
        if self.rewrite_host {
            let host = HeaderValue::from_str(self.route.authority().as_str())
                .map_err(|e| TunnelError::BadGateway(format!("invalid backend authority: {e}")))?;
            parts.headers.insert(HOST, host);
        }

        let outbound = Request::from_parts(parts, body.boxed_unsync());
        let pending = self.client.request(outbound);
        let result = match self.backend_timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                TunnelError::GatewayTimeout(format!("no response from {} within {limit:?}", self.route))
            })?,
            None => pending.await,
        };
        let resp = result.map_err(|e| TunnelError::BadGateway(error_chain(&e)))?;

        let (mut parts, body) = resp.into_parts();
        headers::strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }
}

/// Render a per-request error as a JSON response.
pub fn error_response(err: &TunnelError) -> Response<ProxyBody> {
    let body = serde_json::to_vec(&ErrorResponse::from(err)).unwrap_or_default();
    let mut resp = Response::new(full(body));
    *resp.status_mut() =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// `Display` of the legacy client error omits its cause.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
