//! Header adjustments applied while forwarding.

use std::net::IpAddr;

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Headers that describe a single transport hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    KEEP_ALIVE,
    PROXY_CONNECTION,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append `client` to `X-Forwarded-For`, folding any values already present
/// into a single header.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{}, {client}", prior.join(", "))
    };
    // Prior values passed `to_str`, so the joined chain is always valid.
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, v);
    }
}

/// Mark the request as having arrived over TLS.
pub fn set_forwarded_proto(headers: &mut HeaderMap) {
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
}

/// Adjust an inbound request's headers for the backend.
pub fn prepare_request(headers: &mut HeaderMap, client: IpAddr) {
    strip_hop_by_hop(headers);
    append_forwarded_for(headers, client);
    set_forwarded_proto(headers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{CONTENT_TYPE, HOST};
    use std::net::Ipv4Addr;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        h.insert(KEEP_ALIVE, HeaderValue::from_static("timeout=5"));
        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert(UPGRADE, HeaderValue::from_static("websocket"));
        h.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        strip_hop_by_hop(&mut h);
        assert_eq!(h.len(), 1);
        assert!(h.contains_key(CONTENT_TYPE));
    }

    #[test]
    fn strips_headers_named_by_connection() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("close, X-Secret-Hop"));
        h.insert("x-secret-hop", HeaderValue::from_static("1"));
        h.insert(HOST, HeaderValue::from_static("example.test"));
        strip_hop_by_hop(&mut h);
        assert!(!h.contains_key("x-secret-hop"));
        assert!(h.contains_key(HOST));
    }

    #[test]
    fn forwarded_for_is_set_when_absent() {
        let mut h = HeaderMap::new();
        append_forwarded_for(&mut h, CLIENT);
        assert_eq!(h[&X_FORWARDED_FOR], "192.0.2.7");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut h = HeaderMap::new();
        h.append(&X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.1"));
        h.append(&X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.2"));
        append_forwarded_for(&mut h, CLIENT);
        assert_eq!(h.get_all(&X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(
            h[&X_FORWARDED_FOR],
            "203.0.113.1, 198.51.100.2, 192.0.2.7"
        );
    }

    #[test]
    fn prepare_request_sets_proto_and_keeps_host() {
        let mut h = HeaderMap::new();
        h.insert(HOST, HeaderValue::from_static("app.example.test"));
        h.insert(TE, HeaderValue::from_static("trailers"));
        prepare_request(&mut h, CLIENT);
        assert_eq!(h[&X_FORWARDED_PROTO], "https");
        assert_eq!(h[HOST], "app.example.test");
        assert!(!h.contains_key(TE));
    }
}
