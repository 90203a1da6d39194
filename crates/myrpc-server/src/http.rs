//! HTTP `CONNECT` transport.
//!
//! The RPC stream can ride an HTTP port: the client sends a `CONNECT` to the
//! RPC path, the server answers `200 Connected to MyRPC`, and from then on
//! the socket carries the ordinary preamble-plus-frames protocol. The
//! connection is taken over immediately after the handshake, so the request
//! head is parsed straight off the socket rather than through an HTTP stack.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use myrpc_common::protocol::{CONNECTED, DEFAULT_RPC_PATH};
use myrpc_common::{FrameReader, FrameWriter, Result};

use crate::server::Server;

impl Server {
    /// Accepts HTTP `CONNECT` connections until the listener fails.
    pub async fn run_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "http connection accepted");
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.serve_http_conn(stream).await });
        }
    }

    /// Performs the `CONNECT` handshake, then serves the RPC stream.
    pub async fn serve_http_conn(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let head = match reader.read_http_head().await {
            Ok(head) => head,
            Err(e) => {
                debug!("http handshake: {}", e);
                return;
            }
        };
        let request_line = head.lines().next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");

        if method != "CONNECT" {
            let _ = writer
                .write_raw(
                    b"HTTP/1.0 405 Method Not Allowed\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\r\n\
                      405 must CONNECT\n",
                )
                .await;
            return;
        }
        if path != DEFAULT_RPC_PATH {
            warn!(path, "connect to unknown path");
            let _ = writer.write_raw(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
            return;
        }
        let status = format!("HTTP/1.0 {}\r\n\r\n", CONNECTED);
        if writer.write_raw(status.as_bytes()).await.is_err() {
            return;
        }

        self.serve_transport(reader, writer).await;
    }
}
