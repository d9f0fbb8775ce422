//! Client address and request id resolution from request headers.

use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Value recorded when no client address can be determined.
pub const UNKNOWN_CLIENT_IP: &str = "unknown";

const MAX_HEADER_VALUE_LEN: usize = 128;

fn normalized_header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    let raw = headers.get(key)?.to_str().ok()?.trim();
    if raw.is_empty() || raw.len() > MAX_HEADER_VALUE_LEN {
        return None;
    }
    Some(raw.to_string())
}

fn is_address_like(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b':' || b == b'-' || b == b'[' || b == b']')
}

fn normalized_forwarded_for(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() || first.len() > 64 || !is_address_like(first) {
        return None;
    }
    Some(first.to_string())
}

/// Resolve the client address.
///
/// Order: first `X-Forwarded-For` entry, `X-Real-IP`, the peer address,
/// then [`UNKNOWN_CLIENT_IP`].
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = normalized_forwarded_for(headers) {
        return forwarded;
    }
    if let Some(real_ip) = normalized_header_value(headers, "x-real-ip").filter(|v| is_address_like(v)) {
        return real_ip;
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => UNKNOWN_CLIENT_IP.to_string(),
    }
}

/// Request id supplied by the caller, if any.
pub fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    normalized_header_value(headers, "x-request-id")
        .or_else(|| normalized_header_value(headers, "x-correlation-id"))
}

/// `User-Agent` header, empty when absent or not valid text.
pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for &(k, v) in pairs {
            map.insert(k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "10.0.0.9"),
        ]);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(client_ip(&h, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_then_peer_then_unknown() {
        let h = headers(&[("x-real-ip", "198.51.100.4")]);
        assert_eq!(client_ip(&h, None), "198.51.100.4");

        let peer: SocketAddr = "192.0.2.1:5555".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), UNKNOWN_CLIENT_IP);
    }

    #[test]
    fn test_malformed_forwarded_for_ignored() {
        let h = headers(&[("x-forwarded-for", "<script>, 10.0.0.1")]);
        assert_eq!(client_ip(&h, None), UNKNOWN_CLIENT_IP);
    }

    #[test]
    fn test_request_id_sources() {
        assert_eq!(
            request_id_from_headers(&headers(&[("x-request-id", "abc")])),
            Some("abc".to_string())
        );
        assert_eq!(
            request_id_from_headers(&headers(&[("x-correlation-id", "corr-1")])),
            Some("corr-1".to_string())
        );
        assert_eq!(request_id_from_headers(&headers(&[("x-request-id", "  ")])), None);
        assert_eq!(request_id_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_user_agent() {
        assert_eq!(user_agent(&headers(&[("user-agent", "curl/8.0")])), "curl/8.0");
        assert_eq!(user_agent(&HeaderMap::new()), "");
    }
}
