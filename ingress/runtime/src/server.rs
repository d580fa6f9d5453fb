use crate::Dispatcher;
use hyper::server::conn::http1;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use opensandbox_ingress_core::ResolveBackend;
use tokio::net::TcpListener;
use tracing::{debug, debug_span, warn, Instrument};

/// Serves HTTP/1.1 connections accepted on `listener`, one task per connection.
pub async fn serve<R: ResolveBackend>(listener: TcpListener, dispatcher: Dispatcher<R>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "Failed to accept connection");
                continue;
            }
        };

        let svc = TowerToHyperService::new(dispatcher.with_peer(peer));
        tokio::spawn(
            async move {
                let conn = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .with_upgrades();
                if let Err(error) = conn.await {
                    debug!(%error, "Connection closed");
                }
            }
            .instrument(debug_span!("conn", %peer)),
        );
    }
}
