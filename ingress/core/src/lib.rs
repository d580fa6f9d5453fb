#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod client_ip;
pub mod host;
pub mod routing;

pub use self::{
    client_ip::client_ip,
    host::{ParseError, SandboxHost},
    routing::{ResolveBackend, RoutingError, RoutingOutcome},
};

/// The request header that carries the `<ingress-key>-<port>` routing identifier. It takes
/// precedence over the `Host` header and is never forwarded to a backend.
pub const SANDBOX_INGRESS_HEADER: &str = "opensandbox-ingress-to";

/// Added to every response relayed from a backend.
pub const POWERED_BY_HEADER: &str = "reverse-proxy-server-powerby";

pub const POWERED_BY_VALUE: &str = "OpenSandbox-ingress";

pub const X_REAL_IP: &str = "x-real-ip";

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
