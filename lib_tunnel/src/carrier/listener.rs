//! # Carrier Listener
//!
//! Yields successive carriers to the tunneled HTTP/2 server as if they were
//! freshly accepted TCP connections. The queue between the front gateway and
//! this listener holds a single slot: a second carrier cannot be enqueued
//! until the previous one has been accepted, which is the back-pressure the
//! upstream peer relies on to detect "server already connected".

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc;

use super::ws_conn::WsConn;

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors surfaced by [`CarrierListener::accept`].
pub enum CarrierListenerError {
    /// The carrier source is drained; no further carrier will arrive.
    #[error("carrier listener closed")]
    Closed,
}

/// Accept side of the carrier queue.
pub struct CarrierListener {
    queue: mpsc::Receiver<WsConn>,
    local_addr: Option<SocketAddr>,
}

impl CarrierListener {
    /// Creates the single-slot carrier queue, returning the sender handed to
    /// the front gateway and the listener consumed by the tunnel server.
    pub fn channel() -> (mpsc::Sender<WsConn>, CarrierListener) {
        let (tx, rx) = mpsc::channel(1);
        (
            tx,
            CarrierListener {
                queue: rx,
                local_addr: None,
            },
        )
    }

    /// Blocks until the next carrier arrives. Carriers are yielded strictly
    /// in enqueue order.
    pub async fn accept(&mut self) -> Result<WsConn, CarrierListenerError> {
        match self.queue.recv().await {
            Some(conn) => {
                if self.local_addr.is_none() {
                    self.local_addr = Some(conn.local_addr());
                }
                Ok(conn)
            }
            None => Err(CarrierListenerError::Closed),
        }
    }

    /// Address of the first accepted carrier; `None` before any accept.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// No-op, safe to call any number of times. The queue closes when the
    /// front gateway drops its sender.
    pub fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::SinkExt;
    use tokio::io::AsyncReadExt;
    use tokio_tungstenite::tungstenite;

    use super::*;
    use crate::testsupport;

    /// Connects a peer that immediately identifies itself with `marker`.
    async fn connect_marked(
        addr: SocketAddr,
        marker: u8,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/p")).await.unwrap();
        ws.send(tungstenite::Message::Binary(Bytes::copy_from_slice(&[marker])))
            .await
            .unwrap();
        ws
    }

    async fn marker_of(conn: &mut WsConn) -> u8 {
        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).await.unwrap();
        byte[0]
    }

    #[tokio::test]
    async fn test_accept_yields_carriers_fifo() {
        let (addr, mut listener, _guard) = testsupport::spawn_carrier_endpoint(None).await;

        // Sequential upgrades; none accepted yet, so upgrade N+1 waits on the
        // single queue slot until upgrade N is adopted.
        let _a = connect_marked(addr, b'A').await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _b = connect_marked(addr, b'B').await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _c = connect_marked(addr, b'C').await;

        let mut first = listener.accept().await.unwrap();
        let mut second = listener.accept().await.unwrap();
        let mut third = listener.accept().await.unwrap();
        assert_eq!(marker_of(&mut first).await, b'A');
        assert_eq!(marker_of(&mut second).await, b'B');
        assert_eq!(marker_of(&mut third).await, b'C');
    }

    #[tokio::test]
    async fn test_local_addr_cached_from_first_carrier() {
        let (addr, mut listener, _guard) = testsupport::spawn_carrier_endpoint(None).await;
        assert_eq!(listener.local_addr(), None);

        let _a = connect_marked(addr, b'A').await;
        let first = listener.accept().await.unwrap();
        assert_eq!(listener.local_addr(), Some(first.local_addr()));
    }

    #[tokio::test]
    async fn test_accept_reports_closed_when_source_dropped() {
        let (tx, mut listener) = CarrierListener::channel();
        drop(tx);

        assert_eq!(listener.accept().await.unwrap_err(), CarrierListenerError::Closed);
        listener.close();
        listener.close();
    }
}
