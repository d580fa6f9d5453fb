use crate::SharedIndex;
use opensandbox_ingress_core::{ResolveBackend, RoutingOutcome};
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Resolves a session to its single eligible backend.
#[derive(Clone, Debug)]
pub struct Router {
    index: SharedIndex,
}

// === impl Router ===

impl Router {
    pub fn new(index: SharedIndex) -> Self {
        Self { index }
    }
}

impl ResolveBackend for Router {
    fn resolve(&self, ingress_key: &str, port: &str) -> RoutingOutcome {
        let index = self.index.read();
        match index.get_eligible(ingress_key).as_slice() {
            [] => RoutingOutcome::NotFound,
            [pod] => RoutingOutcome::Unique(authority(&pod.ip, port)),
            pods => {
                // Never pick one of several claimants.
                let names = pods.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
                warn!(%ingress_key, pods = ?names, "multiple backends claim ingress key");
                RoutingOutcome::Conflict(pods.len())
            }
        }
    }
}

fn authority(ip: &str, port: &str) -> String {
    match (ip.parse::<IpAddr>(), port.parse::<u16>()) {
        (Ok(ip), Ok(port)) => SocketAddr::new(ip, port).to_string(),
        _ => format!("{ip}:{port}"),
    }
}
