use crate::agent::Registry;
use crate::appid::AppResolver;
use crate::logger::{Entry, Sink};
use crate::rules::{Action, SharedRules};
use crate::sni::{peek_client_hello, SniError};
use crate::tracker::Tracker;
use chrono::Utc;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Buffer size for the splice byte pumps
const BUFFER_SIZE: usize = 64 * 1024;

/// Upstream connections always target the HTTPS port
const UPSTREAM_PORT: u16 = 443;

/// How a connection is terminated when no splice happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    /// SO_LINGER zero, the peer observes a TCP RST.
    Reset,
    /// Plain close, the peer observes a FIN.
    Graceful,
    /// Nothing to signal, just release the socket.
    Drop,
}

/// Per-connection handler: peeks the ClientHello, evaluates rules and either
/// splices the flow to the upstream host or severs it.
pub struct Handler {
    rules: Arc<SharedRules>,
    tracker: Arc<Tracker>,
    registry: Arc<Registry>,
    access_log: Arc<dyn Sink>,
    app_resolver: Arc<dyn AppResolver>,
    read_timeout: Duration,
    write_timeout: Duration,
    upstream_port: u16,
}

impl Handler {
    pub fn new(
        rules: Arc<SharedRules>,
        tracker: Arc<Tracker>,
        registry: Arc<Registry>,
        access_log: Arc<dyn Sink>,
        app_resolver: Arc<dyn AppResolver>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            rules,
            tracker,
            registry,
            access_log,
            app_resolver,
            read_timeout,
            write_timeout,
            upstream_port: UPSTREAM_PORT,
        }
    }

    #[cfg(test)]
    fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = port;
        self
    }

    pub async fn handle(&self, mut client: TcpStream, peer: SocketAddr) {
        let client_ip = peer.ip();

        // The ClientHello read is deadline-bounded; a client that connects
        // and goes silent is dropped here.
        let peeked = match timeout(self.read_timeout, peek_client_hello(&mut client)).await {
            Ok(Ok(peeked)) => peeked,
            Ok(Err(e)) => {
                self.close_on_peek_failure(client, client_ip, &e);
                return;
            }
            Err(_) => {
                debug!("ClientHello read timed out from {}", client_ip);
                return;
            }
        };
        let (hostname, client_hello) = peeked;

        let src_ip = client_ip.to_string();
        let now = Utc::now();
        let decision = self.rules.match_decision(client_ip, &hostname);

        let (machine, username) = match self.registry.lookup(&src_ip, now) {
            Some(info) => (info.machine, info.username),
            None => (String::new(), String::new()),
        };
        let app = self
            .app_resolver
            .resolve(client_ip, &hostname)
            .unwrap_or_default();

        self.access_log.log(&Entry {
            timestamp: now,
            source_ip: src_ip.clone(),
            hostname: hostname.clone(),
            group: decision.group.clone(),
            action: decision.action,
            machine,
            username,
            app,
        });
        if decision.matched {
            info!(
                "{} | {} -> {} (group {:?}, matched rule)",
                src_ip, hostname, decision.action, decision.group
            );
        } else {
            info!("{} | {} -> {} (default)", src_ip, hostname, decision.action);
        }

        self.tracker.conn_start(&src_ip, now);
        let _conn = ConnScope {
            tracker: Arc::clone(&self.tracker),
            src_ip: src_ip.clone(),
        };

        if decision.action == Action::Block {
            close(client, CloseMode::Reset);
            return;
        }

        self.splice(client, &hostname, client_hello, &src_ip).await;
    }

    fn close_on_peek_failure(&self, client: TcpStream, client_ip: IpAddr, err: &SniError) {
        let mode = peek_failure_mode(client_ip, err);
        match err {
            SniError::NotTls | SniError::NotClientHello => {
                debug!("non-TLS client {} ({}), resetting", client_ip, err);
            }
            SniError::NoSni => {
                debug!("no SNI from {}, closing ({:?})", client_ip, mode);
            }
            _ => {
                debug!("failed to read ClientHello from {}: {}", client_ip, err);
            }
        }
        close(client, mode);
    }

    /// Dials the SNI hostname and relays bytes both ways, replaying the
    /// captured ClientHello first so the upstream sees a byte-identical
    /// handshake.
    async fn splice(&self, client: TcpStream, hostname: &str, client_hello: Vec<u8>, src_ip: &str) {
        let upstream_addr = format!("{}:{}", hostname, self.upstream_port);

        let mut upstream =
            match timeout(self.write_timeout, TcpStream::connect(&upstream_addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("failed to connect to upstream {}: {}", upstream_addr, e);
                    close(client, CloseMode::Reset);
                    return;
                }
                Err(_) => {
                    warn!(
                        "connection timeout to upstream {} ({}s)",
                        upstream_addr,
                        self.write_timeout.as_secs()
                    );
                    close(client, CloseMode::Reset);
                    return;
                }
            };

        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);

        // The captured handshake must reach the upstream before any pumping
        // starts.
        match timeout(self.write_timeout, upstream.write_all(&client_hello)).await {
            Ok(Ok(())) => {}
            _ => {
                warn!("failed to replay ClientHello to {}", upstream_addr);
                return;
            }
        }
        self.tracker
            .add_bytes(src_ip, 0, client_hello.len() as u64, Utc::now());

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let outbound = pump(
            client_read,
            upstream_write,
            Arc::clone(&self.tracker),
            src_ip.to_string(),
            Direction::ClientToUpstream,
        );
        let inbound = pump(
            upstream_read,
            client_write,
            Arc::clone(&self.tracker),
            src_ip.to_string(),
            Direction::UpstreamToClient,
        );

        let (sent, received) = tokio::join!(outbound, inbound);
        debug!(
            "splice done for {} -> {}: {} bytes out, {} bytes in",
            src_ip, upstream_addr, sent, received
        );
    }
}

/// Keeps the tracker's connection count balanced on every exit path.
struct ConnScope {
    tracker: Arc<Tracker>,
    src_ip: String,
}

impl Drop for ConnScope {
    fn drop(&mut self) {
        self.tracker.conn_end(&self.src_ip, Utc::now());
    }
}

#[derive(Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Copies bytes one way, accounting them per iteration, and performs a
/// write-side shutdown on EOF so the peer's FIN propagates (half-close).
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    tracker: Arc<Tracker>,
    src_ip: String,
    direction: Direction,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
        match direction {
            Direction::ClientToUpstream => {
                tracker.add_bytes(&src_ip, 0, n as u64, Utc::now());
            }
            Direction::UpstreamToClient => {
                tracker.add_bytes(&src_ip, n as u64, 0, Utc::now());
            }
        }
    }

    let _ = writer.shutdown().await;
    total
}

/// Maps a peek failure to the way the client socket is closed.
///
/// A private-network client with no SNI is closed gracefully: such flows are
/// typically a device dialing an internal host by IP, and without the
/// original pre-NAT destination they cannot be relayed, only dropped cleanly.
pub(crate) fn peek_failure_mode(client_ip: IpAddr, err: &SniError) -> CloseMode {
    match err {
        SniError::NotTls | SniError::NotClientHello => CloseMode::Reset,
        SniError::NoSni => {
            if is_private_source(client_ip) {
                CloseMode::Graceful
            } else {
                CloseMode::Reset
            }
        }
        _ => CloseMode::Drop,
    }
}

fn close(client: TcpStream, mode: CloseMode) {
    if mode == CloseMode::Reset {
        // Zero linger makes the close abortive: the kernel sends an RST
        // instead of a FIN.
        let _ = client.set_linger(Some(Duration::ZERO));
    }
    drop(client);
}

/// RFC1918 / loopback / unique-local sources.
fn is_private_source(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appid::NoopResolver;
    use crate::logger::MemorySink;
    use crate::tracker::Options;
    use tokio::net::TcpListener;

    fn write_rules(content: &str) -> (tempfile::TempDir, Arc<SharedRules>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        std::fs::write(&path, content).unwrap();
        let rules = Arc::new(SharedRules::load(&path).unwrap());
        (dir, rules)
    }

    fn build_client_hello(hostname: &str) -> Vec<u8> {
        let host = hostname.as_bytes();

        let mut sni_data = Vec::new();
        sni_data.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        sni_data.push(0x00);
        sni_data.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni_data.extend_from_slice(host);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&(sni_data.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_data);

        build_record(&hello_body(&extensions))
    }

    fn build_client_hello_without_sni() -> Vec<u8> {
        build_record(&hello_body(&[]))
    }

    fn hello_body(extensions: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0x00); // session ID length
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x9c]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        if !extensions.is_empty() {
            body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
            body.extend_from_slice(extensions);
        }

        let mut msg = vec![0x01];
        let len = body.len();
        msg.push((len >> 16) as u8);
        msg.push((len >> 8) as u8);
        msg.push(len as u8);
        msg.extend_from_slice(&body);
        msg
    }

    fn build_record(msg: &[u8]) -> Vec<u8> {
        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        record.extend_from_slice(msg);
        record
    }

    struct TestEnv {
        tracker: Arc<Tracker>,
        registry: Arc<Registry>,
        sink: Arc<MemorySink>,
        handler: Arc<Handler>,
        _rules_dir: tempfile::TempDir,
    }

    fn env(rules: &str, upstream_port: u16) -> TestEnv {
        let (_rules_dir, rules) = write_rules(rules);
        let tracker = Arc::new(Tracker::new(Options::default()));
        let registry = Arc::new(Registry::new(Duration::from_secs(60)));
        let sink = Arc::new(MemorySink::new());
        let handler = Arc::new(
            Handler::new(
                rules,
                Arc::clone(&tracker),
                Arc::clone(&registry),
                Arc::clone(&sink) as Arc<dyn Sink>,
                Arc::new(NoopResolver),
                Duration::from_secs(5),
                Duration::from_secs(5),
            )
            .with_upstream_port(upstream_port),
        );
        TestEnv {
            tracker,
            registry,
            sink,
            handler,
            _rules_dir,
        }
    }

    /// Accepts one proxy-side connection and runs the handler on it.
    async fn serve_one(
        handler: Arc<Handler>,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handler.handle(stream, peer).await;
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_allow_splices_and_replays_client_hello() {
        // Fake upstream: expects the exact captured record, then sends a
        // banner and drains the client payload.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let hello = build_client_hello("localhost");
        let hello_len = hello.len();

        let expected = hello.clone();
        let upstream_task = tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut got = vec![0u8; expected.len()];
            conn.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected, "upstream must see a byte-identical ClientHello");

            conn.write_all(b"SERVER-BANNER").await.unwrap();

            let mut rest = Vec::new();
            conn.read_to_end(&mut rest).await.unwrap();
            assert_eq!(rest, b"client-payload");
        });

        let env = env("ALLOW;127.0.0.1;localhost\n", upstream_port);
        let (proxy_addr, proxy_task) = serve_one(Arc::clone(&env.handler)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&hello).await.unwrap();
        client.write_all(b"client-payload").await.unwrap();
        client.shutdown().await.unwrap();

        let mut banner = Vec::new();
        client.read_to_end(&mut banner).await.unwrap();
        assert_eq!(banner, b"SERVER-BANNER");

        upstream_task.await.unwrap();
        proxy_task.await.unwrap();

        // All relayed bytes are reflected in the tracker.
        let snap = env.tracker.snapshot(Utc::now());
        let rec = snap
            .ips
            .iter()
            .find(|r| r.src_ip == "127.0.0.1")
            .expect("source tracked");
        assert_eq!(rec.bytes_out, (hello_len + b"client-payload".len()) as u64);
        assert_eq!(rec.bytes_in, b"SERVER-BANNER".len() as u64);
        assert_eq!(rec.active_conns, 0, "connection scope must have ended");

        let lines = env.sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("| ALLOW |"), "line: {}", lines[0]);
        assert!(lines[0].contains("localhost"));
    }

    #[tokio::test]
    async fn test_block_resets_client() {
        let env = env("BLOCK;127.0.0.1;localhost\n", 1);
        let (proxy_addr, proxy_task) = serve_one(Arc::clone(&env.handler)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(&build_client_hello("localhost"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let res = client.read(&mut buf).await;
        assert!(res.is_err(), "blocked client must observe an RST, got {:?}", res);

        proxy_task.await.unwrap();

        let lines = env.sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("| BLOCK |"));
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_alive() {
        // Upstream shuts down its write side early; the client must see EOF
        // on read while its own writes still reach the upstream.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let hello = build_client_hello("localhost");

        let hello_len = hello.len();
        let upstream_task = tokio::spawn(async move {
            let (conn, _) = upstream.accept().await.unwrap();
            let (mut read_half, mut write_half) = conn.into_split();
            let mut got = vec![0u8; hello_len];
            read_half.read_exact(&mut got).await.unwrap();

            write_half.write_all(b"EARLY-BYE").await.unwrap();
            write_half.shutdown().await.unwrap();

            // The read direction stays open after our FIN.
            let mut late = vec![0u8; b"late-payload".len()];
            read_half.read_exact(&mut late).await.unwrap();
            assert_eq!(late, b"late-payload");
        });

        let env = env("ALLOW;127.0.0.1;localhost\n", upstream_port);
        let (proxy_addr, proxy_task) = serve_one(Arc::clone(&env.handler)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&hello).await.unwrap();

        // Read until EOF: the upstream's FIN must propagate to us while the
        // connection is still half-open.
        let mut early = Vec::new();
        client.read_to_end(&mut early).await.unwrap();
        assert_eq!(early, b"EARLY-BYE");

        client.write_all(b"late-payload").await.unwrap();
        client.shutdown().await.unwrap();

        upstream_task.await.unwrap();
        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_identity_lands_in_access_log() {
        let env = env("BLOCK;127.0.0.1;localhost\n", 1);
        env.registry
            .update("127.0.0.1", "pc-07", "erin", Utc::now());

        let (proxy_addr, proxy_task) = serve_one(Arc::clone(&env.handler)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(&build_client_hello("localhost"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let _ = client.read(&mut buf).await;
        proxy_task.await.unwrap();

        let lines = env.sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(
            lines[0].contains("| pc-07 | erin |"),
            "line: {}",
            lines[0]
        );
    }

    #[tokio::test]
    async fn test_upstream_dial_failure_resets_client() {
        // Grab a free port and close the listener so the dial is refused.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);

        let env = env("ALLOW;127.0.0.1;localhost\n", dead_port);
        let (proxy_addr, proxy_task) = serve_one(Arc::clone(&env.handler)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(&build_client_hello("localhost"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(client.read(&mut buf).await.is_err());

        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_sni_from_private_source_closes_gracefully() {
        // The loopback source gets a clean FIN, not an RST.
        let env = env("# empty\n", 1);
        let (proxy_addr, proxy_task) = serve_one(Arc::clone(&env.handler)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(&build_client_hello_without_sni())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected a graceful EOF");

        proxy_task.await.unwrap();
        // No decision is logged when the peek fails.
        assert!(env.sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_non_tls_client_is_reset() {
        let env = env("# empty\n", 1);
        let (proxy_addr, proxy_task) = serve_one(Arc::clone(&env.handler)).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        assert!(client.read(&mut buf).await.is_err());

        proxy_task.await.unwrap();
    }

    #[test]
    fn test_peek_failure_mode_no_sni_by_source_class() {
        let no_sni = SniError::NoSni;
        assert_eq!(
            peek_failure_mode("8.8.8.8".parse().unwrap(), &no_sni),
            CloseMode::Reset
        );
        assert_eq!(
            peek_failure_mode("192.168.1.50".parse().unwrap(), &no_sni),
            CloseMode::Graceful
        );
        assert_eq!(
            peek_failure_mode("10.0.0.7".parse().unwrap(), &no_sni),
            CloseMode::Graceful
        );
        assert_eq!(
            peek_failure_mode("127.0.0.1".parse().unwrap(), &no_sni),
            CloseMode::Graceful
        );
        assert_eq!(
            peek_failure_mode("fd00::1".parse().unwrap(), &no_sni),
            CloseMode::Graceful
        );
        assert_eq!(
            peek_failure_mode("2001:db8::1".parse().unwrap(), &no_sni),
            CloseMode::Reset
        );
    }

    #[test]
    fn test_peek_failure_mode_protocol_errors() {
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(peek_failure_mode(ip, &SniError::NotTls), CloseMode::Reset);
        assert_eq!(
            peek_failure_mode(ip, &SniError::NotClientHello),
            CloseMode::Reset
        );
        assert_eq!(
            peek_failure_mode(ip, &SniError::BufferTooSmall),
            CloseMode::Drop
        );
    }
}
