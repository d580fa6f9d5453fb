//! Parses the `<ingress-key>-<port>` routing identifier carried by inbound requests.
//!
//! The identifier may arrive in the dedicated routing header or as the leftmost label of the
//! request's host, e.g. `4f1c9a2e-8080.sandbox.example.com`. The ingress key is everything up to
//! the last hyphen of that label and the port is the trailing run of digits.

use http::{header, HeaderMap, HeaderName, Uri};
use regex::Regex;
use std::{fmt, sync::LazyLock};

static SANDBOX_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<key>[a-z0-9][a-z0-9-]*)-(?P<port>[0-9]+)(?:[.:/].*)?$")
        .expect("sandbox host pattern must compile")
});

/// A routing target parsed from a single request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SandboxHost {
    pub ingress_key: String,
    pub port: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("request carries no routing header and no host")]
    MissingHost,

    #[error("{0:?} is not of the form <ingress-key>-<port>[.domain]")]
    InvalidHost(String),

    #[error("{0:?} has an empty ingress key")]
    EmptyKey(String),

    #[error("{0:?} does not carry a valid port")]
    InvalidPort(String),
}

// === impl SandboxHost ===

impl SandboxHost {
    /// Parses a raw routing identifier. A leading URI scheme (`https://`) is ignored.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let host = raw.trim();
        let host = match host.split_once("://") {
            Some((_scheme, rest)) => rest,
            None => host,
        };

        if host.starts_with('-') {
            return Err(ParseError::EmptyKey(raw.to_string()));
        }

        let caps = SANDBOX_HOST
            .captures(host)
            .ok_or_else(|| ParseError::InvalidHost(raw.to_string()))?;
        let port = &caps["port"];
        if port.parse::<u16>().is_err() {
            return Err(ParseError::InvalidPort(raw.to_string()));
        }

        Ok(Self {
            ingress_key: caps["key"].to_string(),
            port: port.to_string(),
        })
    }

    /// Resolves the routing target of a request.
    ///
    /// A non-empty `routing_header` wins; otherwise the `Host` header is used and, failing that,
    /// the authority of an absolute-form request URI. Host names are matched case-insensitively.
    pub fn from_request_parts(
        headers: &HeaderMap,
        uri: &Uri,
        routing_header: &HeaderName,
    ) -> Result<Self, ParseError> {
        let non_empty = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(value) = non_empty(routing_header) {
            return Self::parse(value);
        }

        if let Some(host) = non_empty(&header::HOST) {
            return Self::parse(&host.to_ascii_lowercase());
        }

        match uri.authority() {
            Some(authority) => Self::parse(&authority.as_str().to_ascii_lowercase()),
            None => Err(ParseError::MissingHost),
        }
    }
}

impl fmt::Display for SandboxHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ingress_key, self.port)
    }
}
