//! The HTTP control plane used to inspect and replace the egress policy.

use bytes::Bytes;
use futures::future;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::{
    body::{Body as HttpBody, Incoming},
    header::{self, HeaderName, HeaderValue},
    server::conn::http1,
    Method, Request, Response, StatusCode,
};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use opensandbox_egress_core::{Policy, PolicyStore};
use std::{convert::Infallible, fmt, sync::Arc, task};
use tokio::net::TcpListener;
use tracing::{debug, debug_span, info, warn, Instrument};

pub type Body = BoxBody<Bytes, Infallible>;

/// Policy documents larger than this are rejected.
const MAX_POLICY_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ControlPlane {
    store: Arc<PolicyStore>,
    auth: Option<Auth>,
}

#[derive(Clone)]
struct Auth {
    header: HeaderName,
    token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing {0} header")]
    Missing(HeaderName),

    #[error("invalid token")]
    Mismatch,
}

// === impl ControlPlane ===

impl ControlPlane {
    /// Requests to `/policy` must present `token` in `auth_header`. Without a
    /// token the endpoint is unauthenticated.
    pub fn new(store: Arc<PolicyStore>, auth_header: HeaderName, token: Option<String>) -> Self {
        let auth = token
            .filter(|t| !t.is_empty())
            .map(|token| Auth {
                header: auth_header,
                token,
            });
        Self { store, auth }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub(crate) async fn handle<B>(self, req: Request<B>) -> Response<Body>
    where
        B: HttpBody<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.uri().path() == "/healthz" {
            return match *req.method() {
                Method::GET | Method::HEAD => text(StatusCode::OK, "ok"),
                _ => text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            };
        }
        if req.uri().path() != "/policy" {
            return text(StatusCode::NOT_FOUND, "not found");
        }

        if let Some(auth) = &self.auth {
            if let Err(error) = auth.check(&req) {
                info!(%error, "Rejected policy request");
                return text(StatusCode::UNAUTHORIZED, &error.to_string());
            }
        }

        match *req.method() {
            Method::GET => self.get_policy(),
            Method::POST | Method::PUT => self.put_policy(req.into_body()).await,
            Method::DELETE => {
                self.store.update(None);
                self.get_policy()
            }
            _ => text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    fn get_policy(&self) -> Response<Body> {
        // `null` stands for allow-all.
        match serde_json::to_vec(&self.store.current().as_deref()) {
            Ok(json) => json_response(StatusCode::OK, json),
            Err(error) => {
                warn!(%error, "Failed to serialize policy");
                text(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize policy")
            }
        }
    }

    async fn put_policy<B>(&self, body: B) -> Response<Body>
    where
        B: HttpBody<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bytes = match Limited::new(body, MAX_POLICY_BYTES).collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) => {
                debug!(%error, "Failed to read policy body");
                return text(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };
        let raw = match std::str::from_utf8(&bytes) {
            Ok(raw) => raw.trim(),
            Err(_) => return text(StatusCode::BAD_REQUEST, "policy must be utf-8"),
        };

        if raw.is_empty() || raw == "null" {
            self.store.update(None);
            return self.get_policy();
        }
        match Policy::parse(raw) {
            Ok(policy) => {
                self.store.update(Some(policy));
                self.get_policy()
            }
            Err(error) => {
                info!(%error, "Rejected policy");
                text(StatusCode::BAD_REQUEST, &error.to_string())
            }
        }
    }
}

impl tower::Service<Request<Incoming>> for ControlPlane {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Self::Error>>;

    fn poll_ready(&mut self, _: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let control = self.clone();
        Box::pin(async move { Ok(control.handle(req).await) })
    }
}

/// Serves the control plane on `listener`, one task per connection.
pub async fn serve(listener: TcpListener, control: ControlPlane) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "Failed to accept connection");
                continue;
            }
        };

        let svc = TowerToHyperService::new(control.clone());
        tokio::spawn(
            async move {
                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
                if let Err(error) = conn.await {
                    debug!(%error, "Connection closed");
                }
            }
            .instrument(debug_span!("control", %peer)),
        );
    }
}

// === impl Auth ===

impl Auth {
    fn check<B>(&self, req: &Request<B>) -> Result<(), AuthError> {
        let value = req
            .headers()
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AuthError::Missing(self.header.clone()))?;

        let presented = match value.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            _ => value,
        };
        if constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn text(status: StatusCode, msg: &str) -> Response<Body> {
    let mut rsp = Response::new(Full::new(Bytes::from(format!("{msg}\n"))).boxed());
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp
}

fn json_response(status: StatusCode, json: Vec<u8>) -> Response<Body> {
    let mut rsp = Response::new(Full::new(Bytes::from(json)).boxed());
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    rsp
}
