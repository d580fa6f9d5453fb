use std::fmt;

/// The result of reducing a session's eligible backends to a single target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Exactly one eligible backend, as an `ip:port` authority.
    Unique(String),

    NotFound,

    /// More than one eligible backend claims the session. No backend is chosen.
    Conflict(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no running sandbox found for ingress key {0:?}")]
    NotFound(String),

    #[error("{count} running sandboxes share ingress key {key:?}")]
    Conflict { key: String, count: usize },
}

/// Resolves a session's ingress key and port to a backend address.
pub trait ResolveBackend: Clone + Send + Sync + 'static {
    fn resolve(&self, ingress_key: &str, port: &str) -> RoutingOutcome;
}

// === impl RoutingOutcome ===

impl RoutingOutcome {
    pub fn into_result(self, ingress_key: &str) -> Result<String, RoutingError> {
        match self {
            Self::Unique(addr) => Ok(addr),
            Self::NotFound => Err(RoutingError::NotFound(ingress_key.to_string())),
            Self::Conflict(count) => Err(RoutingError::Conflict {
                key: ingress_key.to_string(),
                count,
            }),
        }
    }
}

impl fmt::Display for RoutingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unique(addr) => addr.fmt(f),
            Self::NotFound => f.write_str("not found"),
            Self::Conflict(n) => write!(f, "conflict ({n} backends)"),
        }
    }
}
