//! # Relay Helpers
//!
//! The copy loop that pumps upstream bytes into HTTP/2 DATA frames with an
//! explicit flush per write, and the scanner that recognizes the end of the
//! single HTTP response a reverse-tunnel peer sends back over the raw byte
//! stream.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::try_reader::TryReader;

/// Copies everything `src` yields into `dst`, flushing after every non-empty
/// write so DATA frames are emitted promptly instead of sitting in library
/// buffers.
pub async fn pump_upstream<R, W>(
    src: &mut TryReader<R>,
    dst: &mut W,
    buf_len: usize,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buf_len];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
    }
}

/// Number of headers the scanner budget allows for.
const MAX_HEADERS: usize = 64;

enum ScanState {
    /// Still collecting the status line and headers.
    Headers,
    /// Counting down a `Content-Length` body.
    Sized { remaining: u64 },
    /// Walking `Transfer-Encoding: chunked` framing.
    Chunked(ChunkState),
    /// No framing information; the response only ends with the connection.
    ToEof,
    /// A full response has been consumed.
    Done,
}

enum ChunkState {
    /// Accumulating a chunk-size line.
    SizeLine { line: Vec<u8> },
    /// Inside chunk data.
    Data { remaining: u64 },
    /// The CRLF that closes a chunk.
    DataCrLf { left: u8 },
    /// After the zero-size chunk: trailers up to the blank line.
    Trailer { tail: Vec<u8> },
}

/// Recognizes one complete HTTP/1.x response on a tee'd byte stream.
///
/// The reverse tunnel forwards raw bytes to the tunneled client while this
/// scanner decides when the peer's response (headers and body) has been
/// fully relayed, so the exchange can be closed without waiting for the
/// peer to hang up.
pub struct ResponseScanner {
    header_buf: Vec<u8>,
    state: ScanState,
}

impl Default for ResponseScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseScanner {
    /// A scanner expecting the start of a response.
    pub fn new() -> Self {
        Self {
            header_buf: Vec::new(),
            state: ScanState::Headers,
        }
    }

    /// Whether a full response has been seen.
    pub fn is_done(&self) -> bool {
        matches!(self.state, ScanState::Done)
    }

    /// Feeds the next tee'd bytes; returns `true` once the response is
    /// complete. Malformed framing degrades to read-until-close rather than
    /// failing the relay.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if matches!(self.state, ScanState::Headers) {
            self.header_buf.extend_from_slice(bytes);

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&self.header_buf) {
                Ok(httparse::Status::Complete(body_start)) => {
                    let next_state = body_state(&response);
                    let rest = self.header_buf[body_start..].to_vec();
                    self.state = next_state;
                    self.header_buf = Vec::new();
                    // Body bytes that arrived together with the headers.
                    self.consume_body(&rest);
                }
                Ok(httparse::Status::Partial) => {}
                Err(_) => self.state = ScanState::ToEof,
            }
            return self.is_done();
        }

        self.consume_body(bytes);
        self.is_done()
    }

    fn consume_body(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match &mut self.state {
                ScanState::Headers => unreachable!("headers are consumed by push"),
                ScanState::Sized { remaining } => {
                    let take = (*remaining).min(bytes.len() as u64);
                    *remaining -= take;
                    bytes = &bytes[take as usize..];
                    if *remaining == 0 {
                        self.state = ScanState::Done;
                    }
                }
                ScanState::Chunked(chunk) => match chunk {
                    ChunkState::SizeLine { line } => {
                        let mut advanced = 0;
                        let mut complete = false;
                        for &b in bytes {
                            advanced += 1;
                            line.push(b);
                            if b == b'\n' {
                                complete = true;
                                break;
                            }
                        }
                        bytes = &bytes[advanced..];
                        if complete {
                            let text = String::from_utf8_lossy(line);
                            let size = u64::from_str_radix(
                                text.trim().split(';').next().unwrap_or("").trim(),
                                16,
                            );
                            match size {
                                Ok(0) => {
                                    self.state =
                                        ScanState::Chunked(ChunkState::Trailer { tail: Vec::new() })
                                }
                                Ok(n) => {
                                    self.state =
                                        ScanState::Chunked(ChunkState::Data { remaining: n })
                                }
                                Err(_) => self.state = ScanState::ToEof,
                            }
                        }
                    }
                    ChunkState::Data { remaining } => {
                        let take = (*remaining).min(bytes.len() as u64);
                        *remaining -= take;
                        bytes = &bytes[take as usize..];
                        if *remaining == 0 {
                            self.state = ScanState::Chunked(ChunkState::DataCrLf { left: 2 });
                        }
                    }
                    ChunkState::DataCrLf { left } => {
                        let take = (*left as usize).min(bytes.len());
                        *left -= take as u8;
                        bytes = &bytes[take..];
                        if *left == 0 {
                            self.state =
                                ScanState::Chunked(ChunkState::SizeLine { line: Vec::new() });
                        }
                    }
                    ChunkState::Trailer { tail } => {
                        let mut advanced = 0;
                        let mut complete = false;
                        for &b in bytes {
                            advanced += 1;
                            tail.push(b);
                            // Trailers end with a bare CRLF; with no
                            // trailers the terminator follows immediately.
                            if tail == b"\r\n" || tail.ends_with(b"\r\n\r\n") {
                                complete = true;
                                break;
                            }
                        }
                        bytes = &bytes[advanced..];
                        if complete {
                            self.state = ScanState::Done;
                        }
                    }
                },
                ScanState::ToEof | ScanState::Done => return,
            }
        }
    }
}

fn body_state(response: &httparse::Response<'_, '_>) -> ScanState {
    // Status codes that never carry a body.
    if let Some(code) = response.code {
        if code == 204 || code == 304 || (100..200).contains(&code) {
            return ScanState::Done;
        }
    }

    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value);
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        } else if header.name.eq_ignore_ascii_case("content-length") {
            content_length = String::from_utf8_lossy(header.value).trim().parse().ok();
        }
    }

    if chunked {
        ScanState::Chunked(ChunkState::SizeLine { line: Vec::new() })
    } else if let Some(0) = content_length {
        ScanState::Done
    } else if let Some(n) = content_length {
        ScanState::Sized { remaining: n }
    } else {
        ScanState::ToEof
    }
}
