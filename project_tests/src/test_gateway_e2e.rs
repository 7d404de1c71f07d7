//! # Gateway End-to-End Harness
//!
//! Drives a live gateway instance from the client side: front health, the
//! carrier upgrade, and the tunneled HTTP/2 surface (health, info JSON and
//! PAC bytes through the synthetic `i:` hosts).
//!
//! ## Usage:
//! Start the gateway (TEST_MODE=1 with a local key pair is the easy path),
//! then run this binary against its front address:
//!
//! `test_gateway_e2e --front 127.0.0.1:8080`
//!
//! The inner TLS hop does not verify the server certificate, so self-signed
//! test certificates work.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use clap::Parser;
use futures_util::{Sink, Stream};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// # Harness Arguments
#[derive(Parser, Debug)]
struct Args {
    /// Front address of the gateway under test (host:port, plain HTTP).
    #[arg(long, default_value = "127.0.0.1:8080")]
    front: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _ = rustls::crypto::ring::default_provider().install_default();

    println!("--- Gateway End-to-End Harness ({}) ---", args.front);

    // --- TEST 1: Front health ---
    println!("\n[Test 1] Front health on /...");
    let response = reqwest::get(format!("http://{}/", args.front)).await?;
    assert!(response.status().is_success(), "front health not 200");
    println!("✅ Front answers {}", response.status());

    // --- TEST 2: Front info document ---
    println!("\n[Test 2] Front /info...");
    let response = reqwest::get(format!("http://{}/info", args.front)).await?;
    let info = response.text().await?;
    assert!(info.contains("PingSecond"), "info missing PingSecond: {info}");
    println!("✅ Info: {info}");

    // --- TEST 3: Carrier upgrade ---
    println!("\n[Test 3] Upgrading /p to a carrier...");
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/p", args.front)).await?;
    let carrier = WsByteStream::new(ws);
    println!("✅ Carrier established");

    // --- TEST 4: TLS + HTTP/2 over the carrier ---
    println!("\n[Test 4] TLS + h2 handshakes over the carrier...");
    let mut tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![b"h2".to_vec()];
    let connector = TlsConnector::from(Arc::new(tls_config));
    let tls_stream = connector
        .connect(ServerName::try_from("localhost")?, carrier)
        .await?;
    let (mut send, conn) = hyper::client::conn::http2::handshake::<_, _, Full<Bytes>>(
        TokioExecutor::new(),
        TokioIo::new(tls_stream),
    )
    .await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    println!("✅ Tunneled HTTP/2 ready");

    // --- TEST 5: Tunneled health ---
    println!("\n[Test 5] GET with host i:80...");
    let response = send.send_request(tunneled_get("i:80")?).await?;
    assert_eq!(response.status(), 200, "i:80 expected 200");
    println!("✅ Health through the tunnel: {}", response.status());

    // --- TEST 6: Tunneled info JSON ---
    println!("\n[Test 6] GET with host i:81...");
    let response = send.send_request(tunneled_get("i:81")?).await?;
    let body = response.into_body().collect().await?.to_bytes();
    println!("✅ Info through the tunnel: {}", String::from_utf8_lossy(&body));

    // --- TEST 7: Tunneled PAC bytes ---
    println!("\n[Test 7] GET with host i:82...");
    let response = send.send_request(tunneled_get("i:82")?).await?;
    let body = response.into_body().collect().await?.to_bytes();
    assert!(!body.is_empty(), "pac body empty");
    println!("✅ PAC through the tunnel: {} bytes", body.len());

    println!("\n--- All harness checks passed ---");
    Ok(())
}

fn tunneled_get(authority: &str) -> Result<Request<Full<Bytes>>, Box<dyn std::error::Error>> {
    let uri = Uri::builder()
        .scheme("https")
        .authority(authority)
        .path_and_query("/")
        .build()?;
    Ok(Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Full::new(Bytes::new()))?)
}

/// The carrier from the client side: binary WebSocket messages exposed as a
/// byte stream for the inner TLS hop.
struct WsByteStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: Option<Bytes>,
}

impl WsByteStream {
    fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
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

/// Trust-anything verifier for the inner hop; the harness targets dev
/// instances with self-signed certificates.
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
