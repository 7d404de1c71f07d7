//! Shared fixtures for the module tests: an in-process front + tunnel
//! wiring, a client-side WebSocket byte stream, an HTTP/2 client that rides
//! it through TLS, and small mock TCP peers.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::acme::install_default_crypto_provider;
use crate::acme::provisioner::tls_config_from_files;
use crate::carrier::{CarrierListener, TextObserver};
use crate::configs::{Config, StoreMode};
use crate::front::{ChallengeStore, FrontGateway};
use crate::tunnel::TunnelServer;

/// PAC document the harness serves.
pub(crate) const TEST_PAC: &str =
    "function FindProxyForURL(url, host) { return \"DIRECT\"; }";

fn test_info() -> Bytes {
    Bytes::from(serde_json::to_vec(&serde_json::json!({"PingSecond": 45})).unwrap())
}

fn test_config(dir: &tempfile::TempDir) -> Arc<Config> {
    Arc::new(Config {
        ws_buf_kib: 65,
        h2_max_frame_kib: 64,
        h2_verbose: false,
        h2_retry_max_secs: 3,
        h2_warmup_secs: 0,
        ping_secs: 45,
        tcp_port: 0,
        dev: true,
        log_level: String::new(),
        acme_domain: "localhost".into(),
        acme_directory: "https://acme.invalid/directory".into(),
        test_mode: true,
        server_crt: dir.path().join("server.crt").to_string_lossy().into_owned(),
        server_key: dir.path().join("server.key").to_string_lossy().into_owned(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        store_mode: StoreMode::Dir,
        store_key: [0u8; 32],
        store_url: dir.path().to_string_lossy().into_owned(),
    })
}

fn write_test_keypair(dir: &tempfile::TempDir) {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".into()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    std::fs::write(dir.path().join("server.crt"), cert.pem()).unwrap();
    std::fs::write(dir.path().join("server.key"), key.serialize_pem()).unwrap();
}

/// Keeps the spawned front (and shared state handles) alive for a test.
pub(crate) struct EndpointGuard {
    pub(crate) challenge: Arc<ChallengeStore>,
    pub(crate) pac: Arc<RwLock<Bytes>>,
    front_task: JoinHandle<()>,
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        self.front_task.abort();
    }
}

/// Spawns a front gateway wired to a fresh carrier listener; no tunnel
/// server is attached, so tests own the accept side.
pub(crate) async fn spawn_carrier_endpoint(
    on_text: Option<TextObserver>,
) -> (SocketAddr, CarrierListener, EndpointGuard) {
    let (carrier_tx, listener) = CarrierListener::channel();
    let challenge = Arc::new(ChallengeStore::new());
    let pac = Arc::new(RwLock::new(Bytes::from_static(TEST_PAC.as_bytes())));
    let front = FrontGateway::new(
        carrier_tx,
        challenge.clone(),
        test_info(),
        pac.clone(),
        65 << 10,
        on_text,
    );
    let bound = front.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = bound.local_addr();
    let front_task = tokio::spawn(async move {
        let _ = bound.serve().await;
    });
    (
        addr,
        listener,
        EndpointGuard {
            challenge,
            pac,
            front_task,
        },
    )
}

/// One plain HTTP/1.1 GET against the front, raw over TCP.
pub(crate) async fn raw_http_get(
    addr: SocketAddr,
    host: &str,
    path: &str,
) -> (u16, String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_ref(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .expect("status code");
    (status, head.to_string(), body.to_string())
}

/// Client-side twin of the server's carrier adapter: a tungstenite socket
/// exposed as a byte stream.
pub(crate) struct WsByteStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: Option<Bytes>,
}

impl WsByteStream {
    pub(crate) fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            inner,
            pending: None,
        }
    }
}

fn ws_err_to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(mut data) = this.pending.take() {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                data.advance(n);
                if !data.is_empty() {
                    this.pending = Some(data);
                }
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(WsMessage::Binary(data))) => {
                    if !data.is_empty() {
                        this.pending = Some(data);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(ws_err_to_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_err_to_io)?;
        Pin::new(&mut this.inner)
            .start_send(WsMessage::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_err_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_err_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(ws_err_to_io)
    }
}

/// Certificate verifier that trusts anything; the harness dials its own
/// self-signed server.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

fn h2_client_tls_config() -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Arc::new(config)
}

/// A fully wired gateway: front + carrier queue + tunnel server over a
/// self-signed test certificate.
pub(crate) struct GatewayHandle {
    front_addr: SocketAddr,
    front_task: JoinHandle<()>,
    tunnel_task: JoinHandle<()>,
    _certs_dir: tempfile::TempDir,
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.front_task.abort();
        self.tunnel_task.abort();
    }
}

pub(crate) async fn spawn_gateway() -> GatewayHandle {
    install_default_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_keypair(&dir);
    let config = test_config(&dir);

    let tls = Arc::new(tls_config_from_files(&config.server_crt, &config.server_key).unwrap());
    let (carrier_tx, listener) = CarrierListener::channel();
    let challenge = Arc::new(ChallengeStore::new());
    let pac = Arc::new(RwLock::new(Bytes::from_static(TEST_PAC.as_bytes())));

    let front = FrontGateway::new(
        carrier_tx,
        challenge,
        test_info(),
        pac.clone(),
        config.ws_buf_bytes(),
        None,
    );
    let bound = front.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let front_addr = bound.local_addr();
    let front_task = tokio::spawn(async move {
        let _ = bound.serve().await;
    });

    let tunnel = TunnelServer::new(config, listener, tls, test_info(), pac);
    let tunnel_task = tokio::spawn(tunnel.run());

    GatewayHandle {
        front_addr,
        front_task,
        tunnel_task,
        _certs_dir: dir,
    }
}

impl GatewayHandle {
    /// Upgrades a carrier and completes TLS + HTTP/2 on it.
    pub(crate) async fn h2_client(&self) -> H2Client {
        self.h2_client_pending().await.ready().await
    }

    /// Upgrades a carrier but defers the inner handshakes; used to park a
    /// replacement peer in the queue.
    pub(crate) async fn h2_client_pending(&self) -> PendingCarrier {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/p", self.front_addr))
            .await
            .unwrap();
        PendingCarrier {
            stream: WsByteStream::new(ws),
        }
    }
}

/// A carrier whose inner TLS/h2 handshakes have not started yet.
pub(crate) struct PendingCarrier {
    stream: WsByteStream,
}

impl PendingCarrier {
    pub(crate) async fn ready(self) -> H2Client {
        let connector = TlsConnector::from(h2_client_tls_config());
        let tls_stream = connector
            .connect(ServerName::try_from("localhost").unwrap(), self.stream)
            .await
            .unwrap();

        let (send, conn) = hyper::client::conn::http2::handshake::<_, _, Full<Bytes>>(
            TokioExecutor::new(),
            TokioIo::new(tls_stream),
        )
        .await
        .unwrap();
        let conn_task = tokio::spawn(async move {
            let _ = conn.await;
        });
        H2Client { send, conn_task }
    }
}

/// HTTP/2 client speaking through the tunnel.
pub(crate) struct H2Client {
    send: hyper::client::conn::http2::SendRequest<Full<Bytes>>,
    conn_task: JoinHandle<()>,
}

impl Drop for H2Client {
    fn drop(&mut self) {
        // Tear the carrier down with the client.
        self.conn_task.abort();
    }
}

impl H2Client {
    pub(crate) async fn get(&mut self, authority: &str, path: &str) -> Response<Incoming> {
        let uri = Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(path)
            .build()
            .unwrap();
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap();
        self.send.send_request(request).await.unwrap()
    }

    pub(crate) async fn connect(&mut self, authority: &str) -> Response<Incoming> {
        let mut parts = hyper::http::uri::Parts::default();
        parts.authority = Some(authority.parse().unwrap());
        let uri = Uri::from_parts(parts).unwrap();
        let request = Request::builder()
            .method(Method::CONNECT)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap();
        self.send.send_request(request).await.unwrap()
    }

    pub(crate) async fn post_reverse(
        &mut self,
        authority: &str,
        inner_request: Vec<u8>,
    ) -> Response<Incoming> {
        let uri = Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query("/r")
            .build()
            .unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(Bytes::from(inner_request)))
            .unwrap();
        self.send.send_request(request).await.unwrap()
    }
}

/// TCP echo peer for `CONNECT` tests.
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Minimal HTTP/1.1 peer for reverse-tunnel tests. Keeps the connection
/// open after responding, so completion must come from response framing,
/// not from EOF.
pub(crate) async fn spawn_mock_http_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                // Hold the connection until the gateway closes it.
                let mut drain = [0u8; 256];
                while matches!(stream.read(&mut drain).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}
