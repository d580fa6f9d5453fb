//! Dispatches inbound requests to the backend pod of the session they name.

use crate::tunnel;
use bytes::Bytes;
use futures::future;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{
    body::Incoming,
    header::{self, HeaderMap, HeaderName, HeaderValue},
    http, Method, Request, Response, StatusCode, Uri,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use opensandbox_ingress_core::{
    client_ip, ResolveBackend, RoutingError, SandboxHost, POWERED_BY_HEADER, POWERED_BY_VALUE,
    X_FORWARDED_FOR,
};
use std::{
    net::{IpAddr, SocketAddr},
    task,
};
use tracing::{debug, info, info_span, warn, Instrument};

pub type Body = BoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to connect to backend {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend request to {addr} failed: {source}")]
    Request {
        addr: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid backend uri: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("invalid backend request: {0}")]
    Http(#[from] http::Error),
}

/// The ingress reverse proxy.
///
/// Each connection gets its own clone, carrying the peer's address.
#[derive(Clone, Debug)]
pub struct Dispatcher<R> {
    resolver: R,
    client: Client<HttpConnector, Incoming>,
    routing_header: HeaderName,
    peer: Option<SocketAddr>,
}

// === impl Dispatcher ===

impl<R: ResolveBackend> Dispatcher<R> {
    pub fn new(resolver: R, routing_header: HeaderName) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            resolver,
            client,
            routing_header,
            peer: None,
        }
    }

    pub(crate) fn with_peer(&self, peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..self.clone()
        }
    }

    pub async fn dispatch(self, req: Request<Incoming>) -> Response<Body> {
        let client_ip = client_ip(req.headers(), self.peer).unwrap_or_default();

        let host =
            match SandboxHost::from_request_parts(req.headers(), req.uri(), &self.routing_header) {
                Ok(host) => host,
                Err(error) => {
                    info!(%error, %client_ip, "Unroutable request");
                    return local_response(StatusCode::NOT_ACCEPTABLE, error.to_string());
                }
            };

        let addr = match self
            .resolver
            .resolve(&host.ingress_key, &host.port)
            .into_result(&host.ingress_key)
        {
            Ok(addr) => addr,
            Err(error) => {
                let status = match error {
                    RoutingError::NotFound(_) => StatusCode::NOT_FOUND,
                    RoutingError::Conflict { .. } => StatusCode::CONFLICT,
                };
                info!(%error, %client_ip, "No backend");
                return local_response(status, error.to_string());
            }
        };

        let span = info_span!("backend", %host, %addr, %client_ip);
        let result = if is_websocket_upgrade(&req) {
            debug!(parent: &span, "Tunneling websocket");
            tunnel::upgrade(req, &addr, &self.routing_header)
                .instrument(span.clone())
                .await
        } else {
            self.forward(req, &addr)
                .instrument(span.clone())
                .await
        };

        match result {
            Ok(rsp) => powered_by(rsp),
            Err(error) => {
                warn!(parent: &span, %error, "Backend unavailable");
                local_response(StatusCode::BAD_GATEWAY, error.to_string())
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        addr: &str,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let (mut parts, body) = req.into_parts();

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!("http://{addr}{path}").parse::<Uri>()?;
        parts.version = http::Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(&self.routing_header);
        if let Ok(host) = HeaderValue::from_str(addr) {
            parts.headers.insert(header::HOST, host);
        }
        append_forwarded_for(&mut parts.headers, self.peer.map(|peer| peer.ip()));

        debug!(uri = %parts.uri, "Forwarding");
        let mut rsp = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| UpstreamError::Request {
                addr: addr.to_string(),
                source: e.into(),
            })?;
        strip_hop_by_hop(rsp.headers_mut());
        Ok(rsp)
    }
}

impl<R: ResolveBackend> tower::Service<Request<Incoming>> for Dispatcher<R> {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Self::Error>>;

    fn poll_ready(&mut self, _: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { Ok(dispatcher.dispatch(req).await) })
    }
}

/// A websocket handshake is a `GET` carrying `Upgrade: websocket` and a `Connection` header that
/// mentions `upgrade`.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let value = |name: HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };

    req.method() == Method::GET
        && value(header::UPGRADE).eq_ignore_ascii_case("websocket")
        && value(header::CONNECTION)
            .to_ascii_lowercase()
            .contains("upgrade")
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop as well.
    let named = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect::<Vec<_>>();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// Appends the transport peer to the `X-Forwarded-For` chain.
fn append_forwarded_for(headers: &mut HeaderMap, peer: Option<IpAddr>) {
    let Some(peer) = peer else {
        return;
    };
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {peer}"),
        _ => peer.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn powered_by(rsp: Response<Incoming>) -> Response<Body> {
    let mut rsp = rsp.map(BodyExt::boxed);
    rsp.headers_mut().append(
        POWERED_BY_HEADER,
        HeaderValue::from_static(POWERED_BY_VALUE),
    );
    rsp
}

fn local_response(status: StatusCode, msg: String) -> Response<Body> {
    let mut rsp = Response::new(
        Full::new(Bytes::from(msg + "\n"))
            .map_err(|never| match never {})
            .boxed(),
    );
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp
}
