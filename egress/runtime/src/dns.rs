use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    serialize::binary::{BinDecodable, BinEncodable},
};
use opensandbox_egress_core::{Action, PolicyStore};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};
use tracing::{debug, debug_span, info, warn, Instrument};

/// Largest datagram accepted from sandbox clients.
const MAX_QUERY_LEN: usize = 4096;

/// Largest datagram accepted from the upstream resolver.
const MAX_RESPONSE_LEN: usize = 65_535;

/// The transport a query arrived on. Allowed queries are forwarded upstream
/// over the same transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream {0} timed out")]
    Timeout(SocketAddr),

    #[error("upstream {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Answers sandbox DNS queries according to the current egress policy.
///
/// Denied names are answered locally with NXDOMAIN and never reach the
/// upstream resolver. Allowed queries are relayed verbatim.
#[derive(Clone, Debug)]
pub struct DnsProxy {
    policy: Arc<PolicyStore>,
    upstream: SocketAddr,
    timeout: Duration,
}

// === impl DnsProxy ===

impl DnsProxy {
    pub fn new(policy: Arc<PolicyStore>, upstream: SocketAddr, timeout: Duration) -> Self {
        Self {
            policy,
            upstream,
            timeout,
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Produces the reply for a single raw query, or `None` if the packet
    /// should be dropped without a response.
    pub async fn handle(&self, packet: &[u8], transport: Transport) -> Option<Vec<u8>> {
        let query = match Message::from_bytes(packet) {
            Ok(query) => query,
            Err(error) => {
                debug!(%error, "Dropping undecodable query");
                return None;
            }
        };

        let name = match query.queries().first() {
            Some(q) => q.name().to_ascii(),
            None => return encode(&reply(&query, ResponseCode::FormErr)),
        };

        // The packet is forwarded whole, so every question must be allowed.
        let denied = query
            .queries()
            .iter()
            .map(|q| q.name().to_ascii())
            .find(|name| self.policy.evaluate(name) == Action::Deny);
        if let Some(name) = denied {
            info!(%name, "Denied");
            return encode(&reply(&query, ResponseCode::NXDomain));
        }

        let forwarded = match transport {
            Transport::Udp => self.forward_udp(query.id(), packet).await,
            Transport::Tcp => self.forward_tcp(packet).await,
        };
        match forwarded {
            Ok(response) => {
                debug!(%name, "Allowed");
                Some(response)
            }
            Err(error) => {
                warn!(%name, %error, "Upstream resolution failed");
                encode(&reply(&query, ResponseCode::ServFail))
            }
        }
    }

    async fn forward_udp(&self, id: u16, packet: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let addr = self.upstream;
        let io = |source| UpstreamError::Io { addr, source };
        let local: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let exchange = async {
            let socket = UdpSocket::bind(local).await.map_err(io)?;
            socket.connect(addr).await.map_err(io)?;
            socket.send(packet).await.map_err(io)?;
            let mut buf = vec![0u8; MAX_RESPONSE_LEN];
            loop {
                let n = socket.recv(&mut buf).await.map_err(io)?;
                // Skip stray datagrams that do not answer this query.
                if n >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                    buf.truncate(n);
                    return Ok::<_, UpstreamError>(buf);
                }
            }
        };

        time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(addr))?
    }

    async fn forward_tcp(&self, packet: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let addr = self.upstream;
        let io = |source| UpstreamError::Io { addr, source };

        let exchange = async {
            let mut stream = TcpStream::connect(addr).await.map_err(io)?;
            write_frame(&mut stream, packet).await.map_err(io)?;
            read_frame(&mut stream).await.map_err(io)
        };

        time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(addr))?
    }

    /// Serves UDP queries from `socket`, one task per datagram.
    pub async fn serve_udp(self, socket: UdpSocket) {
        let socket = Arc::new(socket);
        loop {
            let mut buf = vec![0u8; MAX_QUERY_LEN];
            let (n, client) = match socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(error) => {
                    warn!(%error, "Failed to receive query");
                    continue;
                }
            };
            buf.truncate(n);

            let proxy = self.clone();
            let socket = socket.clone();
            tokio::spawn(
                async move {
                    if let Some(rsp) = proxy.handle(&buf, Transport::Udp).await {
                        if let Err(error) = socket.send_to(&rsp, client).await {
                            debug!(%error, "Failed to send response");
                        }
                    }
                }
                .instrument(debug_span!("udp", %client)),
            );
        }
    }

    /// Serves length-prefixed queries over TCP, one task per connection.
    pub async fn serve_tcp(self, listener: TcpListener) {
        loop {
            let (stream, client) = match listener.accept().await {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            };

            let proxy = self.clone();
            tokio::spawn(
                async move {
                    if let Err(error) = proxy.serve_conn(stream).await {
                        debug!(%error, "Connection closed");
                    }
                }
                .instrument(debug_span!("tcp", %client)),
            );
        }
    }

    async fn serve_conn(&self, mut stream: TcpStream) -> io::Result<()> {
        loop {
            let query = match read_frame(&mut stream).await {
                Ok(query) => query,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.handle(&query, Transport::Tcp).await {
                Some(rsp) => write_frame(&mut stream, &rsp).await?,
                // Nothing sensible can follow an undecodable frame.
                None => return Ok(()),
            }
        }
    }
}

/// Builds a header-only response that echoes the query's id, opcode and
/// questions.
fn reply(query: &Message, code: ResponseCode) -> Message {
    let mut rsp = Message::new();
    rsp.set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    rsp.add_queries(query.queries().iter().cloned());
    rsp
}

fn encode(msg: &Message) -> Option<Vec<u8>> {
    match msg.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            warn!(%error, "Failed to encode response");
            None
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let len = stream.read_u16().await?;
    let mut buf = vec![0u8; len.into()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(stream: &mut TcpStream, msg: &[u8]) -> io::Result<()> {
    let len = u16::try_from(msg.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "message exceeds 65535 bytes"))?;
    let mut frame = Vec::with_capacity(msg.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg);
    stream.write_all(&frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::{
        op::Query,
        rr::{rdata::A, Name, RData, Record, RecordType},
    };
    use opensandbox_egress_core::Policy;
    use std::net::Ipv4Addr;

    const POLICY: &str = r#"{
        "default_action": "deny",
        "egress": [{"action": "allow", "target": "*.example.com"}]
    }"#;

    fn store() -> Arc<PolicyStore> {
        Arc::new(PolicyStore::new(Some(Policy::parse(POLICY).unwrap())))
    }

    fn query(name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        msg.to_bytes().unwrap()
    }

    fn answer(query: &[u8]) -> Vec<u8> {
        let query = Message::from_bytes(query).unwrap();
        let mut rsp = reply(&query, ResponseCode::NoError);
        let name = query.queries()[0].name().clone();
        rsp.add_answer(Record::from_rdata(
            name,
            60,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 10))),
        ));
        rsp.to_bytes().unwrap()
    }

    async fn udp_upstream() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn denied_names_never_reach_upstream() {
        let upstream = udp_upstream().await;
        let proxy = DnsProxy::new(
            store(),
            upstream.local_addr().unwrap(),
            Duration::from_secs(1),
        );

        let rsp = proxy
            .handle(&query("evil.test."), Transport::Udp)
            .await
            .expect("must reply");
        let rsp = Message::from_bytes(&rsp).unwrap();
        assert_eq!(rsp.id(), 0x1234);
        assert_eq!(rsp.message_type(), MessageType::Response);
        assert_eq!(rsp.response_code(), ResponseCode::NXDomain);
        assert_eq!(rsp.queries().len(), 1);
        assert!(rsp.answers().is_empty());

        let mut buf = [0u8; 512];
        let recv = time::timeout(Duration::from_millis(100), upstream.recv_from(&mut buf)).await;
        assert!(recv.is_err(), "upstream must not see denied queries");
    }

    #[tokio::test]
    async fn any_denied_question_denies_the_query() {
        let upstream = udp_upstream().await;
        let proxy = DnsProxy::new(
            store(),
            upstream.local_addr().unwrap(),
            Duration::from_secs(1),
        );

        let mut msg = Message::new();
        msg.set_id(0x4321).set_recursion_desired(true);
        for name in ["api.example.com.", "secret.evil.test."] {
            msg.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        }

        let rsp = proxy
            .handle(&msg.to_bytes().unwrap(), Transport::Udp)
            .await
            .expect("must reply");
        let rsp = Message::from_bytes(&rsp).unwrap();
        assert_eq!(rsp.id(), 0x4321);
        assert_eq!(rsp.response_code(), ResponseCode::NXDomain);
        assert_eq!(rsp.queries().len(), 2);

        let mut buf = [0u8; 512];
        let recv = time::timeout(Duration::from_millis(100), upstream.recv_from(&mut buf)).await;
        assert!(recv.is_err(), "upstream must not see denied queries");
    }

    #[tokio::test]
    async fn allowed_queries_are_relayed_verbatim() {
        let upstream = udp_upstream().await;
        let proxy = DnsProxy::new(
            store(),
            upstream.local_addr().unwrap(),
            Duration::from_secs(1),
        );

        let resolver = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            let rsp = answer(&buf[..n]);
            upstream.send_to(&rsp, from).await.unwrap();
            (buf[..n].to_vec(), rsp)
        });

        let q = query("api.example.com.");
        let rsp = proxy.handle(&q, Transport::Udp).await.expect("must reply");
        let (seen, sent) = resolver.await.unwrap();
        assert_eq!(seen, q);
        assert_eq!(rsp, sent);
        let rsp = Message::from_bytes(&rsp).unwrap();
        assert_eq!(rsp.answers().len(), 1);
    }

    #[tokio::test]
    async fn unanswered_queries_fail() {
        let upstream = udp_upstream().await;
        let proxy = DnsProxy::new(
            store(),
            upstream.local_addr().unwrap(),
            Duration::from_millis(50),
        );

        let rsp = proxy
            .handle(&query("api.example.com."), Transport::Udp)
            .await
            .expect("must reply");
        let rsp = Message::from_bytes(&rsp).unwrap();
        assert_eq!(rsp.id(), 0x1234);
        assert_eq!(rsp.response_code(), ResponseCode::ServFail);
        drop(upstream);
    }

    #[tokio::test]
    async fn malformed_queries() {
        let upstream = udp_upstream().await;
        let proxy = DnsProxy::new(
            store(),
            upstream.local_addr().unwrap(),
            Duration::from_secs(1),
        );

        assert!(proxy.handle(b"\x01", Transport::Udp).await.is_none());

        let mut empty = Message::new();
        empty.set_id(7);
        let rsp = proxy
            .handle(&empty.to_bytes().unwrap(), Transport::Udp)
            .await
            .expect("must reply");
        let rsp = Message::from_bytes(&rsp).unwrap();
        assert_eq!(rsp.id(), 7);
        assert_eq!(rsp.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn allow_all_without_policy() {
        let upstream = udp_upstream().await;
        let proxy = DnsProxy::new(
            Arc::new(PolicyStore::default()),
            upstream.local_addr().unwrap(),
            Duration::from_secs(1),
        );

        let resolver = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            upstream.send_to(&answer(&buf[..n]), from).await.unwrap();
        });

        let rsp = proxy
            .handle(&query("evil.test."), Transport::Udp)
            .await
            .expect("must reply");
        resolver.await.unwrap();
        let rsp = Message::from_bytes(&rsp).unwrap();
        assert_eq!(rsp.response_code(), ResponseCode::NoError);
    }

    #[tokio::test]
    async fn tcp_queries_use_tcp_upstream() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let q = read_frame(&mut conn).await.unwrap();
            write_frame(&mut conn, &answer(&q)).await.unwrap();
        });

        let proxy = DnsProxy::new(store(), upstream_addr, Duration::from_secs(1));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(proxy.serve_tcp(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut client, &query("www.example.com."))
            .await
            .unwrap();
        let rsp = Message::from_bytes(&read_frame(&mut client).await.unwrap()).unwrap();
        assert_eq!(rsp.response_code(), ResponseCode::NoError);
        assert_eq!(rsp.answers().len(), 1);

        write_frame(&mut client, &query("example.com.")).await.unwrap();
        let rsp = Message::from_bytes(&read_frame(&mut client).await.unwrap()).unwrap();
        assert_eq!(rsp.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn serves_udp_clients() {
        let upstream = udp_upstream().await;
        let proxy = DnsProxy::new(
            store(),
            upstream.local_addr().unwrap(),
            Duration::from_secs(1),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(proxy.serve_udp(socket));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query("evil.test."), addr).await.unwrap();
        let mut buf = vec![0u8; 512];
        let (n, _) = time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let rsp = Message::from_bytes(&buf[..n]).unwrap();
        assert_eq!(rsp.response_code(), ResponseCode::NXDomain);
    }
}
