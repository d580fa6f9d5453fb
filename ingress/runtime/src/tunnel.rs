//! Websocket tunneling.
//!
//! The client's handshake is replayed to the backend over a dedicated connection. When the
//! backend switches protocols, its response is relayed to the client and both upgraded
//! connections are spliced together until either side finishes.

use crate::proxy::UpstreamError;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    body::Incoming, client::conn::http1, header::HeaderName, upgrade::OnUpgrade, Request,
    Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{io, net::TcpStream};
use tracing::{debug, Instrument};

pub(crate) async fn upgrade(
    mut req: Request<Incoming>,
    addr: &str,
    routing_header: &HeaderName,
) -> Result<Response<Incoming>, UpstreamError> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| UpstreamError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    let request_error = |e: hyper::Error| UpstreamError::Request {
        addr: addr.to_string(),
        source: e.into(),
    };

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(request_error)?;
    tokio::spawn(
        async move {
            if let Err(error) = conn.with_upgrades().await {
                debug!(%error, "Backend connection failed");
            }
        }
        .in_current_span(),
    );

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut handshake = Request::builder()
        .method(req.method().clone())
        .uri(path)
        .version(req.version())
        .body(Empty::<Bytes>::new())?;
    *handshake.headers_mut() = req.headers().clone();
    handshake.headers_mut().remove(routing_header);

    let mut rsp = sender
        .send_request(handshake)
        .await
        .map_err(request_error)?;

    if rsp.status() == StatusCode::SWITCHING_PROTOCOLS {
        let backend_upgrade = hyper::upgrade::on(&mut rsp);
        tokio::spawn(splice(client_upgrade, backend_upgrade).in_current_span());
    } else {
        debug!(status = %rsp.status(), "Backend declined upgrade");
    }

    Ok(rsp)
}

/// Copies bytes in both directions until either direction reaches end-of-stream or fails.
/// Both connections are then dropped, which terminates the other direction.
async fn splice(client: OnUpgrade, backend: OnUpgrade) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(error) => {
            debug!(%error, "Upgrade failed");
            return;
        }
    };

    let (mut client_rx, mut client_tx) = io::split(TokioIo::new(client));
    let (mut backend_rx, mut backend_tx) = io::split(TokioIo::new(backend));

    tokio::select! {
        res = io::copy(&mut client_rx, &mut backend_tx) => {
            debug!(?res, "Client stream closed");
        }
        res = io::copy(&mut backend_rx, &mut client_tx) => {
            debug!(?res, "Backend stream closed");
        }
    }
}
