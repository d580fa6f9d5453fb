use crate::{serve, Dispatcher};
use anyhow::{bail, Context, Result};
use clap::Parser;
use hyper::header::HeaderName;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use opensandbox_ingress_k8s_index::{Index, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "ingress",
    about = "Routes sandbox sessions to their backend pods",
    version
)]
pub struct Args {
    #[clap(
        long,
        default_value = "opensandbox=info,warn",
        env = "OPENSANDBOX_INGRESS_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace in which sandbox pods run.
    #[clap(long, env = "INGRESS_NAMESPACE", default_value = "default")]
    namespace: String,

    /// The pod label whose value identifies a sandbox session.
    #[clap(
        long,
        env = "INGRESS_LABEL_KEY",
        default_value = "sandbox.opensandbox.io/ingress-key"
    )]
    ingress_label_key: String,

    #[clap(long, env = "INGRESS_PROXY_ADDR", default_value = "0.0.0.0:28888")]
    proxy_addr: SocketAddr,

    /// The request header that names the target session. Takes precedence over `Host`.
    #[clap(long, default_value = "opensandbox-ingress-to")]
    routing_header: HeaderName,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            ingress_label_key,
            proxy_addr,
            routing_header,
        } = self;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;

        // Only pods that carry the ingress label can ever be routed to.
        let index = Index::shared(&ingress_label_key);
        let pods = runtime.watch_namespaced::<Pod>(
            namespace.clone(),
            watcher::Config::default().labels(&ingress_label_key),
        );
        tokio::spawn(
            kubert::index::namespaced(index.clone(), pods)
                .instrument(info_span!("pods", ns = %namespace)),
        );

        let listener = TcpListener::bind(proxy_addr)
            .await
            .with_context(|| format!("failed to bind ingress proxy on {proxy_addr}"))?;
        info!(addr = %proxy_addr, %namespace, label = %ingress_label_key, "Ingress proxy listening");

        let dispatcher = Dispatcher::new(Router::new(index), routing_header);
        tokio::spawn(serve(listener, dispatcher).instrument(info_span!("proxy")));

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
