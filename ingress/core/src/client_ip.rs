use crate::{X_FORWARDED_FOR, X_REAL_IP};
use http::HeaderMap;
use std::net::SocketAddr;

/// Determines the originating client's IP.
///
/// `X-Real-IP` is preferred, then the first entry of `X-Forwarded-For`, and finally the
/// transport peer's address (without its port).
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<String> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(ip) = header(X_REAL_IP).map(str::trim).filter(|ip| !ip.is_empty()) {
        return Some(ip.to_string());
    }

    if let Some(forwarded) = header(X_FORWARDED_FOR) {
        let first = forwarded.split(',').next().unwrap_or_default().trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }

    remote.map(|addr| addr.ip().to_string())
}
