//! # TryReader
//!
//! Read-side quirk compensation for the upstream TCP peer of a `CONNECT`
//! tunnel. The HTTP/2 client drives its inner TLS handshake across discrete
//! records, and splitting those records across short reads has been observed
//! to stall the handshake, so the first few reads pass through untouched.
//! After that, short reads are aggregated under a small deadline so large
//! HTTP/2 DATA frames get filled without waiting out the full latency
//! budget, with a single long-deadline read as the fallback when nothing
//! arrived at all.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

/// Reads the TLS handshake typically performs before data flows
/// (client-hello, change-cipher-spec, finished).
const HANDSHAKE_READS: u32 = 3;
/// Aggregation attempts per read call.
const MAX_RETRY: u32 = 2;
/// Deadline for each aggregation attempt.
const TRY_DUR: Duration = Duration::from_millis(600);
/// Deadline for the fallback read.
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Wrapper that batches short reads after the pass-through phase.
pub struct TryReader<R> {
    inner: R,
    ignore: u32,
    ignored: u32,
    max_retry: u32,
    try_dur: Duration,
    timeout: Duration,
    /// Error observed after bytes were already aggregated; surfaced by the
    /// next call so no byte is lost.
    pending_err: Option<io::Error>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> TryReader<R> {
    /// Wraps `inner` with the production parameters.
    pub fn new(inner: R) -> Self {
        Self::with_params(inner, HANDSHAKE_READS, MAX_RETRY, TRY_DUR, READ_TIMEOUT)
    }

    /// Wraps `inner` with explicit phase parameters.
    pub fn with_params(
        inner: R,
        ignore: u32,
        max_retry: u32,
        try_dur: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            ignore,
            ignored: 0,
            max_retry,
            try_dur,
            timeout,
            pending_err: None,
            eof: false,
        }
    }

    /// Reads into `buf`, returning `Ok(n)` whenever `n > 0` and the only
    /// failure was an elapsed deadline. Non-timeout errors propagate
    /// verbatim.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.pending_err.take() {
            return Err(err);
        }
        if self.eof || buf.is_empty() {
            return Ok(0);
        }

        // Pass-through phase: no deadline, one underlying read.
        if self.ignored < self.ignore {
            self.ignored += 1;
            return self.inner.read(buf).await;
        }

        // Aggregation phase.
        let mut n = 0usize;
        let mut err: Option<io::Error> = None;
        let mut tries = 0;
        while n < buf.len() && err.is_none() && !self.eof && tries < self.max_retry {
            tries += 1;
            match timeout(self.try_dur, self.inner.read(&mut buf[n..])).await {
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(read)) => n += read,
                Ok(Err(e)) => err = Some(e),
                Err(_) => err = Some(timeout_error()),
            }
        }
        if n == buf.len() {
            return Ok(n);
        }

        match err {
            None => Ok(n),
            Some(e) if e.kind() == io::ErrorKind::TimedOut => {
                if n > 0 {
                    Ok(n)
                } else {
                    // Fallback phase: one long-deadline read.
                    match timeout(self.timeout, self.inner.read(buf)).await {
                        Ok(result) => result,
                        Err(_) => Err(timeout_error()),
                    }
                }
            }
            Some(e) => {
                if n > 0 {
                    self.pending_err = Some(e);
                    Ok(n)
                } else {
                    Err(e)
                }
            }
        }
    }
}

fn timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "upstream read deadline elapsed")
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncWriteExt, ReadBuf};

    use super::*;

    #[tokio::test]
    async fn test_pass_through_returns_underlying_reads_verbatim() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = TryReader::with_params(
            rx,
            3,
            2,
            Duration::from_millis(20),
            Duration::from_millis(50),
        );

        let mut buf = [0u8; 64];
        for chunk in [&b"a"[..], &b"bc"[..], &b"def"[..]] {
            tx.write_all(chunk).await.unwrap();
            tx.flush().await.unwrap();
            // Give the duplex a beat so each chunk is its own short read.
            tokio::time::sleep(Duration::from_millis(5)).await;
            let n = reader.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], chunk);
        }
    }

    #[tokio::test]
    async fn test_aggregation_batches_bursts() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = TryReader::with_params(
            rx,
            0,
            4,
            Duration::from_millis(80),
            Duration::from_millis(200),
        );

        tokio::spawn(async move {
            for chunk in [&b"1111"[..], &b"2222"[..], &b"33"[..]] {
                tx.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            // Keep the writer open past the read window.
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        // More than one burst must have been folded into a single read.
        assert!(n > 4, "aggregated only {n} bytes");
    }

    #[tokio::test]
    async fn test_full_buffer_within_window_returns_complete() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = TryReader::with_params(
            rx,
            0,
            2,
            Duration::from_millis(100),
            Duration::from_millis(200),
        );

        tokio::spawn(async move {
            tx.write_all(b"abcd").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(b"efgh").await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        let (_tx, rx) = tokio::io::duplex(1024);
        let mut reader = TryReader::with_params(
            rx,
            0,
            2,
            Duration::from_millis(10),
            Duration::from_millis(30),
        );

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_eof_after_partial_data() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = TryReader::with_params(
            rx,
            0,
            3,
            Duration::from_millis(50),
            Duration::from_millis(100),
        );

        tx.write_all(b"tail").await.unwrap();
        drop(tx);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    /// Reader that yields one chunk, then a hard error.
    struct FailAfter {
        data: Option<&'static [u8]>,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(chunk) => {
                    buf.put_slice(chunk);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "peer reset",
                ))),
            }
        }
    }

    #[tokio::test]
    async fn test_non_timeout_error_preserved_after_buffered_bytes() {
        let mut reader = TryReader::with_params(
            FailAfter { data: Some(b"xy") },
            0,
            3,
            Duration::from_millis(50),
            Duration::from_millis(100),
        );

        let mut buf = [0u8; 8];
        // Bytes first, the reset on the following call.
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_non_timeout_error_propagates_verbatim() {
        let mut reader = TryReader::with_params(
            FailAfter { data: None },
            0,
            3,
            Duration::from_millis(50),
            Duration::from_millis(100),
        );

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
