use crate::{control, ControlPlane, DnsProxy};
use anyhow::{Context, Result};
use clap::Parser;
use hyper::header::HeaderName;
use opensandbox_egress_core::{Policy, PolicyStore};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, UdpSocket},
    signal::unix::{signal, SignalKind},
};
use tracing::{info, info_span, warn, Instrument};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_UPSTREAM: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

#[derive(Debug, Parser)]
#[clap(
    name = "egress",
    about = "Enforces the sandbox egress policy at DNS resolution time",
    version
)]
pub struct Args {
    #[clap(
        long,
        default_value = "opensandbox=info,warn",
        env = "OPENSANDBOX_EGRESS_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// The control plane address. A bare `:port` listens on all interfaces.
    #[clap(long, env = "OPENSANDBOX_EGRESS_HTTP_ADDR", default_value = ":18080")]
    http_addr: ListenAddr,

    /// The token required to read or replace the policy.
    #[clap(long, env = "OPENSANDBOX_EGRESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[clap(long, default_value = "OPENSANDBOX-EGRESS-AUTH")]
    auth_header: HeaderName,

    #[clap(long, env = "OPENSANDBOX_EGRESS_DNS_ADDR", default_value = "127.0.0.1:15353")]
    dns_addr: SocketAddr,

    /// The resolver that allowed queries are forwarded to. Defaults to the first
    /// nameserver in /etc/resolv.conf.
    #[clap(long, env = "OPENSANDBOX_EGRESS_UPSTREAM")]
    upstream: Option<SocketAddr>,

    #[clap(long, default_value = "5000")]
    upstream_timeout_ms: u64,

    /// A JSON policy to enforce at startup. Without one, all names are allowed.
    #[clap(long, env = "OPENSANDBOX_EGRESS_POLICY")]
    policy: Option<String>,
}

/// A listen address that may omit its IP, e.g. `:18080`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ListenAddr(SocketAddr);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            http_addr: ListenAddr(http_addr),
            token,
            auth_header,
            dns_addr,
            upstream,
            upstream_timeout_ms,
            policy,
        } = self;

        log_format.try_init(log_level)?;

        let policy = match policy.as_deref().map(str::trim) {
            None | Some("") | Some("null") => None,
            Some(raw) => Some(Policy::parse(raw).context("invalid initial policy")?),
        };
        let store = Arc::new(PolicyStore::new(policy));

        let upstream = match upstream {
            Some(addr) => addr,
            None => tokio::fs::read_to_string(RESOLV_CONF)
                .await
                .ok()
                .and_then(|conf| nameserver(&conf, dns_addr))
                .unwrap_or(FALLBACK_UPSTREAM),
        };
        let dns = DnsProxy::new(
            store.clone(),
            upstream,
            Duration::from_millis(upstream_timeout_ms),
        );

        let udp = UdpSocket::bind(dns_addr)
            .await
            .with_context(|| format!("failed to bind DNS on udp {dns_addr}"))?;
        let tcp = TcpListener::bind(dns_addr)
            .await
            .with_context(|| format!("failed to bind DNS on tcp {dns_addr}"))?;
        info!(addr = %dns_addr, upstream = %dns.upstream(), "DNS proxy listening");
        tokio::spawn(dns.clone().serve_udp(udp).instrument(info_span!("dns")));
        tokio::spawn(dns.serve_tcp(tcp).instrument(info_span!("dns")));

        let control = ControlPlane::new(store, auth_header, token);
        if !control.is_authenticated() {
            warn!("No token configured; the policy endpoint is unauthenticated");
        }
        let listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("failed to bind control plane on {http_addr}"))?;
        info!(addr = %http_addr, "Control plane listening");
        tokio::spawn(control::serve(listener, control).instrument(info_span!("control")));

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
        info!("Shutting down");
        Ok(())
    }
}

/// Returns the first nameserver in a resolv.conf, skipping `this` so the
/// proxy never forwards to itself.
fn nameserver(conf: &str, this: SocketAddr) -> Option<SocketAddr> {
    conf.lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("nameserver") => words.next()?.parse::<IpAddr>().ok(),
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, 53))
        .find(|addr| *addr != this)
}

// === impl ListenAddr ===

impl FromStr for ListenAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}").parse().map(Self),
            None => s.parse().map(Self),
        }
    }
}
