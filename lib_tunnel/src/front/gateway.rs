//! # Front Gateway
//!
//! Plain-HTTP server on the platform-provided address. The back-office peer
//! upgrades `/p` to a WebSocket that becomes the carrier; the ACME client's
//! validator hits the well-known challenge path; everything else answers 200
//! so platform health probes stay green. The push of a fresh carrier into
//! the queue is a rendezvous: a second upgrade cannot complete the push until
//! the previous carrier has been adopted by the tunnel server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tower_http::catch_panic::CatchPanicLayer;

use crate::carrier::{TextObserver, WsConn};
use crate::front::challenge::ChallengeStore;

/// Shared state behind the front routes.
pub struct FrontState {
    carrier_tx: mpsc::Sender<WsConn>,
    challenge: Arc<ChallengeStore>,
    info: Bytes,
    pac: Arc<RwLock<Bytes>>,
    ws_buf: usize,
    on_text: Option<TextObserver>,
    local_addr: SocketAddr,
}

/// The plain-HTTP front server.
pub struct FrontGateway {
    carrier_tx: mpsc::Sender<WsConn>,
    challenge: Arc<ChallengeStore>,
    info: Bytes,
    pac: Arc<RwLock<Bytes>>,
    ws_buf: usize,
    on_text: Option<TextObserver>,
}

impl FrontGateway {
    /// Assembles the front over the carrier queue sender and the shared
    /// challenge store / info / PAC caches.
    pub fn new(
        carrier_tx: mpsc::Sender<WsConn>,
        challenge: Arc<ChallengeStore>,
        info: Bytes,
        pac: Arc<RwLock<Bytes>>,
        ws_buf: usize,
        on_text: Option<TextObserver>,
    ) -> Self {
        Self {
            carrier_tx,
            challenge,
            info,
            pac,
            ws_buf,
            on_text,
        }
    }

    /// Binds `addr` and returns the bound server; binding first lets callers
    /// (and tests, which bind port 0) learn the effective address before
    /// serving.
    pub async fn bind(self, addr: SocketAddr) -> std::io::Result<BoundFront> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(FrontState {
            carrier_tx: self.carrier_tx,
            challenge: self.challenge,
            info: self.info,
            pac: self.pac,
            ws_buf: self.ws_buf,
            on_text: self.on_text,
            local_addr,
        });
        Ok(BoundFront {
            local_addr,
            listener,
            router: router(state),
        })
    }
}

/// A front server bound to its address, ready to serve.
pub struct BoundFront {
    local_addr: SocketAddr,
    listener: TcpListener,
    router: Router,
}

impl BoundFront {
    /// The effective bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until the process ends.
    pub async fn serve(self) -> std::io::Result<()> {
        tracing::info!(addr = %self.local_addr, "front gateway listening");
        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

fn router(state: Arc<FrontState>) -> Router {
    Router::new()
        .route("/p", get(serve_carrier))
        .route("/.well-known/acme-challenge/{token}", any(serve_challenge))
        .route("/info", get(serve_info))
        .route("/pac", get(serve_pac))
        .fallback(health)
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// `GET /p`: promote the connection to a carrier.
async fn serve_carrier(
    State(state): State<Arc<FrontState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!(%peer, "websocket start");
    let buf = state.ws_buf;
    ws.write_buffer_size(buf)
        .on_upgrade(move |socket| async move {
            tracing::debug!(%peer, "websocket ok");
            let conn = WsConn::new(socket, state.local_addr, peer, state.on_text.clone());
            // Rendezvous push; blocks while the previous carrier is
            // unadopted. The peer treats the stall as "already connected".
            if state.carrier_tx.send(conn).await.is_err() {
                tracing::error!(%peer, "carrier queue closed, dropping carrier");
            }
        })
}

async fn serve_challenge(
    State(state): State<Arc<FrontState>>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    state.challenge.serve(host, &method, uri.path())
}

async fn serve_info(State(state): State<Arc<FrontState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.info.clone(),
    )
        .into_response()
}

async fn serve_pac(State(state): State<Arc<FrontState>>) -> Response {
    state.pac.read().await.clone().into_response()
}

async fn health() -> StatusCode {
    StatusCode::OK
}
