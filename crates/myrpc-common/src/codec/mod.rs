//! Message framing over a byte stream.
//!
//! Frames carry no length prefix: both codecs are self-delimiting, so message
//! boundaries are recovered by attempting to decode exactly one value from
//! the front of an accumulation buffer and asking for more bytes while the
//! value is incomplete. The same reader parses the JSON preamble and the
//! negotiated body codec, so no negotiated byte can be lost between the two
//! phases.
//!
//! Writes are buffered and flushed once per message or frame; reads pull
//! straight from the socket into the accumulation buffer.

mod payload;

pub use payload::{CodecKind, Payload};

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::Header;

/// Ceiling on a single message; a buffer that grows past this without
/// yielding a complete value aborts the connection.
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Ceiling on an HTTP handshake head.
const MAX_HTTP_HEAD: usize = 8 * 1024;

/// Decoding half of a connection.
pub struct FrameReader {
    io: Box<dyn AsyncRead + Send + Unpin>,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(io: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            io: Box::new(io),
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads one message and parses it into the codec's dynamic value.
    pub async fn read_payload(&mut self, kind: CodecKind) -> Result<Payload> {
        loop {
            if let Some((payload, used)) = try_decode(kind, &self.buf)? {
                self.buf.advance(used);
                return Ok(payload);
            }
            if self.buf.len() > MAX_MESSAGE_SIZE {
                return Err(RpcError::Codec(format!(
                    "message exceeds {} bytes",
                    MAX_MESSAGE_SIZE
                )));
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                // EOF between messages is a normal hangup; EOF inside one is
                // framing loss.
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Err(RpcError::Disconnected);
                }
                return Err(RpcError::ConnectionLost(
                    "unexpected end of stream inside a message".to_string(),
                ));
            }
        }
    }

    /// Reads one message and decodes it into a concrete type.
    pub async fn read_message<T: DeserializeOwned>(&mut self, kind: CodecKind) -> Result<T> {
        self.read_payload(kind).await?.decode()
    }

    /// Reads one header frame.
    pub async fn read_header(&mut self, kind: CodecKind) -> Result<Header> {
        self.read_message(kind).await
    }

    /// Consumes an HTTP request or response head, up to and including the
    /// blank line. Any bytes already buffered past the head stay buffered.
    pub async fn read_http_head(&mut self) -> Result<String> {
        loop {
            if let Some(end) = find_blank_line(&self.buf) {
                let head = self.buf.split_to(end + 4);
                return String::from_utf8(head.to_vec())
                    .map_err(|e| RpcError::HttpHandshake(e.to_string()));
            }
            if self.buf.len() > MAX_HTTP_HEAD {
                return Err(RpcError::HttpHandshake("head too large".to_string()));
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(RpcError::Disconnected);
            }
        }
    }
}

/// Encoding half of a connection.
pub struct FrameWriter {
    io: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameWriter {
    pub fn new(io: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            io: BufWriter::new(Box::new(io)),
        }
    }

    /// Writes one standalone message (the preamble) and flushes.
    pub async fn write_message<T: Serialize>(&mut self, kind: CodecKind, value: &T) -> Result<()> {
        let bytes = kind.to_bytes(value)?;
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Writes a `(Header, Body)` frame atomically and flushes.
    ///
    /// Callers serialize frames with a send lock; this method must be the
    /// only writer while it runs.
    pub async fn write_frame<T: Serialize>(
        &mut self,
        kind: CodecKind,
        header: &Header,
        body: &T,
    ) -> Result<()> {
        let header_bytes = kind.to_bytes(header)?;
        let body_bytes = kind.to_bytes(body)?;
        self.io.write_all(&header_bytes).await?;
        self.io.write_all(&body_bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// [`write_frame`](Self::write_frame) for an already-erased body.
    pub async fn write_reply(
        &mut self,
        kind: CodecKind,
        header: &Header,
        body: &Payload,
    ) -> Result<()> {
        let header_bytes = kind.to_bytes(header)?;
        let body_bytes = body.to_bytes()?;
        self.io.write_all(&header_bytes).await?;
        self.io.write_all(&body_bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Writes raw bytes (the HTTP handshake) and flushes.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Attempts to decode one complete value from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` when the
/// buffer holds only a prefix of a value.
fn try_decode(kind: CodecKind, buf: &[u8]) -> Result<Option<(Payload, usize)>> {
    match kind {
        CodecKind::Json => {
            let mut stream =
                serde_json::Deserializer::from_slice(buf).into_iter::<serde_json::Value>();
            match stream.next() {
                None => Ok(None),
                Some(Ok(value)) => {
                    let used = stream.byte_offset();
                    // A JSON message is newline-terminated. Waiting for the
                    // terminator keeps a trailing number from being cut at a
                    // read boundary, and keeps the terminator itself from
                    // leaking into the next message — which matters when the
                    // next message is the first binary frame after the
                    // preamble.
                    match buf[used..].first() {
                        Some(&b'\n') => Ok(Some((Payload::Json(value), used + 1))),
                        Some(_) => Ok(Some((Payload::Json(value), used))),
                        None => Ok(None),
                    }
                }
                Some(Err(e)) if e.is_eof() => Ok(None),
                Some(Err(e)) => Err(RpcError::Codec(e.to_string())),
            }
        }
        CodecKind::Binary => {
            let mut cursor = std::io::Cursor::new(buf);
            match ciborium::de::from_reader::<ciborium::Value, _>(&mut cursor) {
                Ok(value) => {
                    let used = cursor.position() as usize;
                    Ok(Some((Payload::Binary(value), used)))
                }
                Err(ciborium::de::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    Ok(None)
                }
                Err(e) => Err(RpcError::Codec(e.to_string())),
            }
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
