//! # Tunneled HTTP/2 Server
//!
//! Serves TLS-terminated HTTP/2 over whatever carrier the listener yields,
//! and keeps serving across carrier failures with a capped linear backoff.
//! Dispatch: `CONNECT` relays raw TCP, `POST /r` reverses a plain HTTP
//! exchange, and the synthetic hosts `i:80`/`i:81`/`i:82` answer health,
//! info JSON and PAC bytes from inside the tunnel.

use std::convert::Infallible;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;

use crate::carrier::listener::{CarrierListener, CarrierListenerError};
use crate::configs::Config;
use crate::tunnel::relay::{pump_upstream, ResponseScanner};
use crate::tunnel::try_reader::TryReader;

/// Upstream dial budget for `CONNECT` and reverse tunnels.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type HandlerBody = BoxBody<Bytes, io::Error>;

/// Backoff counter shared between the retry loop and the fresh-connection
/// hook, which race on it.
pub(crate) struct RetryBackoff {
    current: Mutex<u64>,
    max: u64,
}

impl RetryBackoff {
    pub(crate) fn new(max: u64) -> Self {
        Self {
            current: Mutex::new(1),
            max,
        }
    }

    /// The delay to sleep after a failed serve; advances the counter toward
    /// the ceiling.
    pub(crate) fn next_delay(&self) -> Duration {
        let mut guard = self.current.lock().expect("backoff lock poisoned");
        let delay = *guard;
        if *guard < self.max {
            *guard += 1;
        }
        Duration::from_secs(delay)
    }

    /// A fresh carrier reached the server; the next delay drops back to 1 s.
    pub(crate) fn reset(&self) {
        *self.current.lock().expect("backoff lock poisoned") = 1;
    }
}

/// State shared by every tunneled request.
pub(crate) struct TunnelState {
    info: Bytes,
    pac: Arc<RwLock<Bytes>>,
    copy_buf_len: usize,
    verbose: bool,
}

/// The HTTP/2 server over TLS over the carrier listener.
pub struct TunnelServer {
    config: Arc<Config>,
    listener: CarrierListener,
    tls: Arc<rustls::ServerConfig>,
    state: Arc<TunnelState>,
    backoff: Arc<RetryBackoff>,
}

impl TunnelServer {
    /// Assembles the server; `info` and `pac` are the cached documents the
    /// synthetic hosts answer with.
    pub fn new(
        config: Arc<Config>,
        listener: CarrierListener,
        tls: Arc<rustls::ServerConfig>,
        info: Bytes,
        pac: Arc<RwLock<Bytes>>,
    ) -> Self {
        let state = Arc::new(TunnelState {
            info,
            pac,
            copy_buf_len: config.ws_buf_bytes(),
            verbose: config.h2_verbose,
        });
        let backoff = Arc::new(RetryBackoff::new(config.h2_retry_max_secs));
        Self {
            config,
            listener,
            tls,
            state,
            backoff,
        }
    }

    /// Runs until the carrier source closes. Never returns while carriers
    /// can still arrive; every serve failure is logged and retried.
    pub async fn run(mut self) {
        tokio::time::sleep(self.config.h2_warmup()).await;

        let acceptor = TlsAcceptor::from(self.tls.clone());
        let max_frame = self.config.h2_max_frame_bytes();

        if self.config.tcp_port > 0 {
            let port = self.config.tcp_port;
            let acceptor = acceptor.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_tcp(port, acceptor, state, max_frame).await {
                    tracing::error!(error = %e, port, "tcp tunnel listener failed");
                }
            });
        }

        loop {
            match self.listener.accept().await {
                Ok(carrier) => {
                    // Fresh carrier reached the server: the backoff resets
                    // before anything can go wrong on it.
                    self.backoff.reset();
                    tracing::debug!(peer = %carrier.peer_addr(), "carrier adopted");
                    if let Err(e) =
                        serve_tls_connection(&acceptor, carrier, self.state.clone(), max_frame)
                            .await
                    {
                        // May be benign: the carrier closed under the server.
                        tracing::error!(error = %e, "h2 server failed");
                    }
                }
                Err(CarrierListenerError::Closed) => {
                    tracing::error!("carrier source closed, tunnel server exiting");
                    return;
                }
            }
            tokio::time::sleep(self.backoff.next_delay()).await;
        }
    }
}

/// Terminates TLS on `io` and serves HTTP/2 on top until the connection
/// dies.
async fn serve_tls_connection<IO>(
    acceptor: &TlsAcceptor,
    io: IO,
    state: Arc<TunnelState>,
    max_frame: u32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tls_stream = acceptor.accept(io).await?;

    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move {
            // Structured catch at the outermost per-request boundary; never
            // used for control flow inside the handlers.
            match AssertUnwindSafe(dispatch(state, req)).catch_unwind().await {
                Ok(response) => Ok::<_, Infallible>(response),
                Err(_panic) => {
                    tracing::error!("tunneled request handler panicked");
                    Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR))
                }
            }
        }
    });

    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder.max_frame_size(max_frame);
    builder.serve_connection(TokioIo::new(tls_stream), service).await?;
    Ok(())
}

/// Extra plain-TCP listener for the tunneled service (`WSH_TCP`).
async fn serve_tcp(
    port: u16,
    acceptor: TlsAcceptor,
    state: Arc<TunnelState>,
    max_frame: u32,
) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "tcp tunnel listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_tls_connection(&acceptor, stream, state, max_frame).await {
                tracing::error!(error = %e, %peer, "tcp h2 connection failed");
            }
        });
    }
}

/// The host a tunneled request targets: the `:authority` pseudo-header,
/// falling back to `Host`.
fn req_host(req: &Request<Incoming>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.to_string();
    }
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn dispatch(state: Arc<TunnelState>, req: Request<Incoming>) -> Response<HandlerBody> {
    let host = req_host(&req);
    if state.verbose {
        tracing::debug!(method = %req.method(), host, path = req.uri().path(), "tunneled request");
    }

    if req.method() == Method::CONNECT {
        return serve_connect(state, req, host).await;
    }
    match host.as_str() {
        "i:80" => return status_response(StatusCode::OK),
        "i:81" => return bytes_response(state.info.clone()),
        "i:82" => return bytes_response(state.pac.read().await.clone()),
        _ => {}
    }
    if req.uri().path() == "/r" && req.method() == Method::POST {
        return serve_reverse(state, req, host).await;
    }
    status_response(StatusCode::BAD_REQUEST)
}

/// `CONNECT <host>`: raw TCP relay.
///
/// Dial first so failures can still answer 501; on success the 200 response
/// goes out and the upgraded stream is piped to the remote, with the
/// remote-to-client direction batched through a [`TryReader`] and flushed
/// per write.
async fn serve_connect(
    state: Arc<TunnelState>,
    req: Request<Incoming>,
    host: String,
) -> Response<HandlerBody> {
    let remote = match dial(&host).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, host, "dial failed");
            return status_response(StatusCode::NOT_IMPLEMENTED);
        }
    };

    let copy_buf_len = state.copy_buf_len;
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::error!(error = %e, host, "connect upgrade failed");
                return;
            }
        };
        let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(upgraded));
        let (remote_read, mut remote_write) = remote.into_split();

        // Auxiliary direction: request bytes into the remote.
        let uplink = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut client_read, &mut remote_write).await;
        });

        let mut reader = TryReader::new(remote_read);
        if let Err(e) = pump_upstream(&mut reader, &mut client_write, copy_buf_len).await {
            tracing::debug!(error = %e, host, "connect tunnel ended");
        }
        let _ = client_write.shutdown().await;
        // Dropping the remote halves is the close that unblocks the peer.
        uplink.abort();
    });

    status_response(StatusCode::OK)
}

/// `POST /r`: reversed HTTP tunnel.
///
/// The request body streams to the remote while the remote's bytes are teed
/// into the response body. A single HTTP response is recognized on the tee;
/// once it is fully relayed the exchange closes instead of waiting for the
/// peer to hang up. The 200 response headers go out before the tee starts.
async fn serve_reverse(
    state: Arc<TunnelState>,
    req: Request<Incoming>,
    host: String,
) -> Response<HandlerBody> {
    let remote = match dial(&host).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, host, "dial failed");
            return status_response(StatusCode::NOT_IMPLEMENTED);
        }
    };
    let (mut remote_read, remote_write) = remote.into_split();

    tokio::spawn(copy_body_to_remote(req.into_body(), remote_write));

    let (frames_tx, frames_rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(1);
    let copy_buf_len = state.copy_buf_len;
    tokio::spawn(async move {
        let mut scanner = ResponseScanner::new();
        let mut buf = vec![0u8; copy_buf_len];
        loop {
            match remote_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    let done = scanner.push(&chunk);
                    if frames_tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        break;
                    }
                    if done {
                        tracing::debug!(host, "reverse exchange complete");
                        break;
                    }
                }
                Err(e) => {
                    let _ = frames_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(BoxBody::new(StreamBody::new(ReceiverStream::new(frames_rx))))
        .unwrap()
}

async fn copy_body_to_remote(mut body: Incoming, mut remote: OwnedWriteHalf) {
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if remote.write_all(data).await.is_err() {
                        return;
                    }
                }
            }
            // Body errors mean the carrier or stream died; the close of the
            // write half is all the signal the remote needs.
            Some(Err(_)) | None => return,
        }
    }
}

async fn dial(host: &str) -> io::Result<TcpStream> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(host)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial deadline elapsed")),
    }
}

fn status_response(code: StatusCode) -> Response<HandlerBody> {
    Response::builder()
        .status(code)
        .body(empty_body())
        .unwrap()
}

fn bytes_response(data: Bytes) -> Response<HandlerBody> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(data).map_err(io::Error::other).boxed())
        .unwrap()
}

fn empty_body() -> HandlerBody {
    Empty::<Bytes>::new().map_err(io::Error::other).boxed()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::testsupport::{self, TEST_PAC};

    #[test]
    fn test_backoff_sequence_is_linear_and_capped() {
        let backoff = RetryBackoff::new(4);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 3, 4, 4, 4]);
    }

    #[test]
    fn test_backoff_reset_returns_to_one_second() {
        let backoff = RetryBackoff::new(30);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_health_via_carrier() {
        let gateway = testsupport::spawn_gateway().await;
        let mut h2 = gateway.h2_client().await;

        let response = h2.get("i:80", "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_info_and_pac_via_carrier() {
        let gateway = testsupport::spawn_gateway().await;
        let mut h2 = gateway.h2_client().await;

        let response = h2.get("i:81", "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), br#"{"PingSecond":45}"#);

        let response = h2.get("i:82", "/").await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), TEST_PAC.as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_host_is_bad_request() {
        let gateway = testsupport::spawn_gateway().await;
        let mut h2 = gateway.h2_client().await;

        let response = h2.get("somewhere.else", "/whatever").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connect_tunnel_relays_echo() {
        let echo_addr = testsupport::spawn_echo_server().await;
        let gateway = testsupport::spawn_gateway().await;
        let mut h2 = gateway.h2_client().await;

        let response = h2.connect(&echo_addr.to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let upgraded = hyper::upgrade::on(response).await.unwrap();
        let mut tunnel = TokioIo::new(upgraded);
        tunnel.write_all(b"ABC").await.unwrap();
        tunnel.flush().await.unwrap();

        let mut echoed = [0u8; 3];
        tunnel.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ABC");
    }

    #[tokio::test]
    async fn test_connect_to_dead_target_is_501() {
        let gateway = testsupport::spawn_gateway().await;
        let mut h2 = gateway.h2_client().await;

        // A port nothing listens on; the dial fails fast with a refusal.
        let vacated = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = vacated.local_addr().unwrap();
        drop(vacated);

        let response = h2.connect(&dead_addr.to_string()).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_reverse_tunnel_relays_http_exchange() {
        let http_addr = testsupport::spawn_mock_http_server("hi").await;
        let gateway = testsupport::spawn_gateway().await;
        let mut h2 = gateway.h2_client().await;

        let inner_request = b"GET / HTTP/1.1\r\nHost: peer\r\n\r\n".to_vec();
        let response = h2.post_reverse(&http_addr.to_string(), inner_request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("200 OK"), "tee missing status line: {text}");
        assert!(text.ends_with("hi"), "tee missing body: {text}");
    }

    #[tokio::test]
    async fn test_carrier_replacement_resumes_service() {
        let gateway = testsupport::spawn_gateway().await;

        // Peer A carries a working tunnel.
        let mut first = gateway.h2_client().await;
        let response = first.get("i:80", "/").await;
        assert_eq!(response.status(), StatusCode::OK);

        // Peer B upgrades while A is still adopted, then A dies.
        let pending = gateway.h2_client_pending().await;
        drop(first);

        // The retry loop backs off, adopts B and serves again.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let mut second = pending.ready().await;
        let response = second.get("i:80", "/").await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
