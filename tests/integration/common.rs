//! Shared harness: a forwarder on ephemeral ports, a SOCKS5 client and mock
//! gateway, target and inspector servers

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use proxy_forwarder::{Config, ProxyForwarder, RpcClient};

pub const GATEWAY_USER: &str = "gw-user";
pub const GATEWAY_PASSWORD: &str = "gw-pass";
pub const REFUSAL: [u8; 2] = [0x01, 0xFF];
pub const CONNECT_OK: &str = "HTTP/1.1 200 Connection established\r\n\r\n";

const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Forwarder harness
// ============================================================================

/// Configuration pointing the upstream gateway at a local mock
pub fn test_config(gateway_port: u16) -> Config {
    let mut config = Config::default();
    config.upstream.host = "127.0.0.1".into();
    config.upstream.port = gateway_port;
    config.upstream.username = GATEWAY_USER.into();
    config.upstream.base_password = GATEWAY_PASSWORD.into();
    config.tunnel.connect_timeout_secs = 2;
    config.listen.handshake_timeout_secs = 2;
    config
}

/// A running forwarder
pub struct Harness {
    pub forwarder: Arc<ProxyForwarder>,
    pub socks5_addr: SocketAddr,
    pub control_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Harness {
    pub async fn start(config: Config) -> Self {
        let forwarder = Arc::new(ProxyForwarder::new(config));
        let listeners = forwarder
            .bind_to("127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let socks5_addr = listeners.socks5_addr().unwrap();
        let control_addr = listeners.control_addr().unwrap();
        let handle = tokio::spawn(Arc::clone(&forwarder).serve(listeners));

        Self {
            forwarder,
            socks5_addr,
            control_addr,
            handle,
        }
    }

    pub fn client(&self) -> RpcClient {
        RpcClient::new(self.control_addr)
    }

    /// Wait for `serve` to return without triggering shutdown
    pub async fn join(self) {
        tokio::time::timeout(Duration::from_secs(3), self.handle)
            .await
            .expect("forwarder did not stop")
            .unwrap();
    }

    pub async fn stop(self) {
        self.forwarder.shutdown();
        self.join().await;
    }
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Read until `n` bytes arrive, the peer closes or the read times out
pub async fn read_up_to(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf[filled..])).await {
            Ok(Ok(0) | Err(_)) | Err(_) => break,
            Ok(Ok(k)) => filled += k,
        }
    }
    buf.truncate(filled);
    buf
}

/// Whether the peer closed the stream (EOF or reset) within the timeout
pub async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0) | Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}

// ============================================================================
// SOCKS5 client
// ============================================================================

pub enum Socks5Outcome {
    Connected { stream: TcpStream, reply: [u8; 10] },
    Refused(Vec<u8>),
}

impl Socks5Outcome {
    pub fn connected(self) -> (TcpStream, [u8; 10]) {
        match self {
            Self::Connected { stream, reply } => (stream, reply),
            Self::Refused(bytes) => panic!("expected a tunnel, got refusal {bytes:?}"),
        }
    }

    pub fn refusal(self) -> Vec<u8> {
        match self {
            Self::Connected { reply, .. } => panic!("expected a refusal, got reply {reply:?}"),
            Self::Refused(bytes) => bytes,
        }
    }
}

/// CONNECT request for an IPv4 destination
pub fn ipv4_request(target: SocketAddrV4) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

/// CONNECT request for a domain name destination
pub fn domain_request(domain: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
    request.extend_from_slice(domain.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

pub async fn socks5_connect(
    proxy: SocketAddr,
    username: &str,
    password: &str,
    target: SocketAddrV4,
) -> Socks5Outcome {
    socks5_negotiate(proxy, &[0x05, 0x01, 0x02], username, password, &ipv4_request(target)).await
}

/// Authenticate, send a CONNECT and collect everything the proxy writes
/// afterwards until it closes the stream
pub async fn socks5_transcript(
    proxy: SocketAddr,
    username: &str,
    password: &str,
    target: SocketAddrV4,
) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    assert_eq!(read_up_to(&mut stream, 2).await, [0x05, 0x02]);

    let mut auth = vec![0x01, username.len() as u8];
    auth.extend_from_slice(username.as_bytes());
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    stream.write_all(&auth).await.unwrap();
    assert_eq!(read_up_to(&mut stream, 2).await, [0x01, 0x00]);

    stream.write_all(&ipv4_request(target)).await.unwrap();
    let mut transcript = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0) | Err(_)) => break,
            Ok(Ok(n)) => transcript.extend_from_slice(&buf[..n]),
            Err(_) => panic!("proxy did not close the stream"),
        }
    }
    transcript
}

/// Run greeting, authentication and request, stopping at the first refusal
pub async fn socks5_negotiate(
    proxy: SocketAddr,
    greeting: &[u8],
    username: &str,
    password: &str,
    request: &[u8],
) -> Socks5Outcome {
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    if stream.write_all(greeting).await.is_err() {
        return Socks5Outcome::Refused(read_up_to(&mut stream, 2).await);
    }
    let choice = read_up_to(&mut stream, 2).await;
    if choice != [0x05, 0x02] {
        return Socks5Outcome::Refused(choice);
    }

    let mut auth = vec![0x01, username.len() as u8];
    auth.extend_from_slice(username.as_bytes());
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    stream.write_all(&auth).await.unwrap();
    let status = read_up_to(&mut stream, 2).await;
    if status != [0x01, 0x00] {
        return Socks5Outcome::Refused(status);
    }

    stream.write_all(request).await.unwrap();
    let head = read_up_to(&mut stream, 2).await;
    if head != [0x05, 0x00] {
        return Socks5Outcome::Refused(head);
    }
    let rest = read_up_to(&mut stream, 8).await;
    if rest.len() != 8 {
        let mut partial = head;
        partial.extend_from_slice(&rest);
        return Socks5Outcome::Refused(partial);
    }

    let mut reply = [0u8; 10];
    reply[..2].copy_from_slice(&head);
    reply[2..].copy_from_slice(&rest);
    Socks5Outcome::Connected { stream, reply }
}

// ============================================================================
// Mock servers
// ============================================================================

/// Mock upstream gateway speaking HTTP CONNECT
///
/// Answers every request with a fixed status line. Accepted tunnels are
/// handed to the test through [`MockGateway::next_tunnel`].
pub struct MockGateway {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<String>>>,
    tunnels: mpsc::UnboundedReceiver<TcpStream>,
}

impl MockGateway {
    pub async fn accepting() -> Self {
        Self::start(CONNECT_OK, b"").await
    }

    pub async fn start(reply: &'static str, early: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (tx, tunnels) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let seen = Arc::clone(&seen);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Some(head) = read_request_head(&mut stream).await else {
                        return;
                    };
                    seen.lock().push(head);

                    let mut response = reply.as_bytes().to_vec();
                    response.extend_from_slice(early);
                    if stream.write_all(&response).await.is_err() {
                        return;
                    }
                    if reply.starts_with("HTTP/1.1 200") {
                        let _ = tx.send(stream);
                    } else {
                        let _ = stream.shutdown().await;
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            requests,
            tunnels,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Target side of the next established tunnel
    pub async fn next_tunnel(&mut self) -> TcpStream {
        tokio::time::timeout(IO_TIMEOUT, self.tunnels.recv())
            .await
            .expect("no tunnel reached the gateway")
            .unwrap()
    }
}

async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    String::from_utf8(head).ok()
}

/// Echo server on loopback (reached directly, bypassing the gateway)
pub async fn spawn_echo() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
        unreachable!("bound to an IPv4 address");
    };
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
