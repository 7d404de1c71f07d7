//! # Carrier Connection
//!
//! [`WsConn`] presents an upgraded WebSocket as a plain bidirectional byte
//! stream so TLS and HTTP/2 can be layered on top of it. Binary messages
//! carry opaque payload bytes; text messages never enter the byte stream,
//! they are handed to an optional observer hook or dropped. Message
//! boundaries are invisible to readers: end-of-message advances to the next
//! binary message, and only the close of the WebSocket itself surfaces as
//! EOF.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Hook receiving every text message seen on the carrier, in order.
pub type TextObserver = Arc<dyn Fn(Utf8Bytes) + Send + Sync>;

/// A WebSocket adopted as a byte-stream connection.
pub struct WsConn {
    socket: WebSocket,
    /// Remainder of the binary message currently being drained.
    pending: Option<Bytes>,
    on_text: Option<TextObserver>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("pending", &self.pending)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl WsConn {
    /// Adopts `socket` as a carrier. The observer is fixed at construction;
    /// when `None`, text messages are discarded.
    pub fn new(
        socket: WebSocket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        on_text: Option<TextObserver>,
    ) -> Self {
        Self {
            socket,
            pending: None,
            on_text,
            local_addr,
            peer_addr,
        }
    }

    /// Address of the front listener this carrier arrived through.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the back-office peer that dialed in.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

fn ws_err_to_io(err: axum::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

impl AsyncRead for WsConn {
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

            match ready!(Pin::new(&mut this.socket).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    // An empty binary message must not read as EOF.
                    if !data.is_empty() {
                        this.pending = Some(data);
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(observer) = &this.on_text {
                        observer(text);
                    }
                }
                // Ping/Pong are protocol chatter, Close is followed by the
                // stream ending on the next poll.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(ws_err_to_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for WsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.socket).poll_ready(cx)).map_err(ws_err_to_io)?;
        // Exactly one binary message per write call.
        Pin::new(&mut this.socket)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_err_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket)
            .poll_flush(cx)
            .map_err(ws_err_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().socket)
            .poll_close(cx)
            .map_err(ws_err_to_io)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite;

    use super::*;
    use crate::testsupport;

    #[tokio::test]
    async fn test_round_trip_binary_bytes() {
        let (addr, mut listener, _guard) = testsupport::spawn_carrier_endpoint(None).await;
        let (mut client, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/p")).await.unwrap();
        let mut carrier = listener.accept().await.unwrap();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client
            .send(tungstenite::Message::Binary(payload.clone().into()))
            .await
            .unwrap();

        let mut got = vec![0u8; payload.len()];
        carrier.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_read_spans_message_boundaries() {
        let (addr, mut listener, _guard) = testsupport::spawn_carrier_endpoint(None).await;
        let (mut client, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/p")).await.unwrap();
        let mut carrier = listener.accept().await.unwrap();

        for chunk in [&b"AB"[..], &b"CD"[..], &b"EF"[..]] {
            client
                .send(tungstenite::Message::Binary(Bytes::copy_from_slice(chunk)))
                .await
                .unwrap();
        }

        let mut got = [0u8; 6];
        carrier.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ABCDEF");
    }

    #[tokio::test]
    async fn test_write_is_one_binary_message() {
        let (addr, mut listener, _guard) = testsupport::spawn_carrier_endpoint(None).await;
        let (mut client, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/p")).await.unwrap();
        let mut carrier = listener.accept().await.unwrap();

        carrier.write_all(b"hello carrier").await.unwrap();
        carrier.flush().await.unwrap();

        match client.next().await.unwrap().unwrap() {
            tungstenite::Message::Binary(data) => assert_eq!(&data[..], b"hello carrier"),
            other => panic!("expected one binary message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_text_messages_diverted_to_observer_in_order() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: TextObserver = Arc::new(move |text: Utf8Bytes| {
            sink.lock().unwrap().push(text.to_string());
        });

        let (addr, mut listener, _guard) =
            testsupport::spawn_carrier_endpoint(Some(observer)).await;
        let (mut client, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/p")).await.unwrap();
        let mut carrier = listener.accept().await.unwrap();

        client.send(tungstenite::Message::Binary(Bytes::from_static(b"12"))).await.unwrap();
        client.send(tungstenite::Message::Text("first".into())).await.unwrap();
        client.send(tungstenite::Message::Text("second".into())).await.unwrap();
        client.send(tungstenite::Message::Binary(Bytes::from_static(b"34"))).await.unwrap();

        // The interleaved text must not corrupt the byte stream.
        let mut got = [0u8; 4];
        carrier.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"1234");
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_text_messages_dropped_without_observer() {
        let (addr, mut listener, _guard) = testsupport::spawn_carrier_endpoint(None).await;
        let (mut client, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/p")).await.unwrap();
        let mut carrier = listener.accept().await.unwrap();

        client.send(tungstenite::Message::Text("noise".into())).await.unwrap();
        client.send(tungstenite::Message::Binary(Bytes::from_static(b"ok"))).await.unwrap();

        let mut got = [0u8; 2];
        carrier.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ok");
    }

    #[tokio::test]
    async fn test_close_reads_as_clean_eof() {
        let (addr, mut listener, _guard) = testsupport::spawn_carrier_endpoint(None).await;
        let (mut client, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/p")).await.unwrap();
        let mut carrier = listener.accept().await.unwrap();

        client.send(tungstenite::Message::Binary(Bytes::from_static(b"x"))).await.unwrap();
        client.close(None).await.unwrap();

        let mut got = Vec::new();
        carrier.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"x");
    }
}
