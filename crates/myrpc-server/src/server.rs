//! Connection handling and the per-request pipeline.
//!
//! Each accepted connection gets one reader task. The reader validates the
//! JSON preamble, then loops: read a header, resolve the method, read the
//! body, and spawn the handler — so a slow handler never blocks the next
//! request on the same connection. Responses are serialized by a single send
//! mutex around the frame writer; a `(Header, Body)` pair is always emitted
//! atomically, but responses are not ordered by seq.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use myrpc_common::{
    CodecKind, Empty, FrameReader, FrameWriter, Header, Options, Payload, Result, RpcError,
    MAGIC_NUMBER,
};

use crate::service::{split_service_method, Method, Service};

/// An RPC server: a set of registered services plus accept loops.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use myrpc_server::{Server, Service};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize, Serialize)]
/// struct Args { num1: i32, num2: i32 }
///
/// # async fn run() -> myrpc_common::Result<()> {
/// let server = Arc::new(Server::new());
/// server.register(
///     Service::new("Foo")?.method("Sum", |a: Args| async move { Ok(a.num1 + a.num2) })?,
/// )?;
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
/// server.run(listener).await
/// # }
/// ```
pub struct Server {
    services: RwLock<HashMap<String, Service>>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a service. Duplicate names are rejected.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().expect("service map poisoned");
        if services.contains_key(service.name()) {
            return Err(RpcError::ServiceAlreadyDefined(service.name().to_string()));
        }
        debug!(service = service.name(), "service registered");
        services.insert(service.name().to_string(), service);
        Ok(())
    }

    /// Invocation count of a registered method, keyed `"Service.Method"`.
    pub fn method_calls(&self, service_method: &str) -> Option<u64> {
        let (service, method) = split_service_method(service_method).ok()?;
        let services = self.services.read().expect("service map poisoned");
        Some(services.get(service)?.get(method)?.num_calls())
    }

    fn find_method(&self, service_method: &str) -> Result<Arc<Method>> {
        let (service_name, method_name) = split_service_method(service_method)?;
        let services = self.services.read().expect("service map poisoned");
        let service = services
            .get(service_name)
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        service
            .get(method_name)
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))
    }

    /// Accepts TCP connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "connection accepted");
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }

    /// Serves one established connection to completion.
    pub async fn serve_conn(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        self.serve_transport(FrameReader::new(read_half), FrameWriter::new(write_half))
            .await;
    }

    /// Preamble validation plus the request loop.
    ///
    /// A bad magic number or unknown codec identifier closes the connection
    /// without writing anything back.
    pub(crate) async fn serve_transport(
        self: Arc<Self>,
        mut reader: FrameReader,
        writer: FrameWriter,
    ) {
        let options: Options = match reader.read_message(CodecKind::Json).await {
            Ok(options) => options,
            Err(RpcError::Disconnected) => return,
            Err(e) => {
                warn!("options error: {}", e);
                return;
            }
        };
        if options.magic != MAGIC_NUMBER {
            warn!("invalid magic number {:#x}", options.magic);
            return;
        }
        let Some(kind) = CodecKind::from_name(&options.codec_type) else {
            warn!("invalid codec type {}", options.codec_type);
            return;
        };

        let writer = Arc::new(Mutex::new(writer));
        let handle_timeout = options.handle_timeout();
        let handlers = TaskTracker::new();

        loop {
            let header = match reader.read_header(kind).await {
                Ok(header) => header,
                Err(e) => {
                    if !e.is_disconnect() {
                        warn!("read header: {}", e);
                    }
                    break;
                }
            };

            let method = match self.find_method(&header.service_method) {
                Ok(method) => method,
                Err(resolve_err) => {
                    // The body is on the wire either way; drain it so the
                    // next header starts on a message boundary.
                    if let Err(e) = reader.read_payload(kind).await {
                        if !e.is_disconnect() {
                            warn!("drain body: {}", e);
                        }
                        break;
                    }
                    let mut header = header;
                    header.error = resolve_err.to_string();
                    send_response(&writer, kind, &header, &Empty {}).await;
                    continue;
                }
            };

            let args = match reader.read_payload(kind).await {
                Ok(args) => args,
                Err(e) => {
                    // Framing is lost; report on this seq and give up on the
                    // connection.
                    warn!("read body: {}", e);
                    let mut header = header;
                    header.error = e.to_string();
                    send_response(&writer, kind, &header, &Empty {}).await;
                    break;
                }
            };

            let writer = Arc::clone(&writer);
            handlers.spawn(handle_request(
                method,
                header,
                args,
                kind,
                writer,
                handle_timeout,
            ));
        }

        // Keep the connection open until every in-flight handler has sent
        // (or abandoned) its response.
        handlers.close();
        handlers.wait().await;
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches one request and writes exactly one response for its seq.
async fn handle_request(
    method: Arc<Method>,
    mut header: Header,
    args: Payload,
    kind: CodecKind,
    writer: Arc<Mutex<FrameWriter>>,
    timeout: Option<Duration>,
) {
    let result = match timeout {
        // On expiry the dispatch future is dropped: the handler's eventual
        // completion can never produce a second response for this seq.
        Some(limit) => match tokio::time::timeout(limit, method.dispatch(args, kind)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "request handle timeout: expect within {:?}",
                limit
            )),
        },
        None => method.dispatch(args, kind).await,
    };

    match result {
        Ok(reply) => {
            header.error.clear();
            let mut writer = writer.lock().await;
            if let Err(e) = writer.write_reply(kind, &header, &reply).await {
                warn!("write response: {}", e);
            }
        }
        Err(message) => {
            header.error = message;
            send_response(&writer, kind, &header, &Empty {}).await;
        }
    }
}

/// Writes one response frame under the send mutex.
async fn send_response<T: Serialize>(
    writer: &Mutex<FrameWriter>,
    kind: CodecKind,
    header: &Header,
    body: &T,
) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_frame(kind, header, body).await {
        warn!("write response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Serialize, Deserialize)]
    struct SumArgs {
        num1: i32,
        num2: i32,
    }

    fn test_server() -> Arc<Server> {
        let server = Server::new();
        server
            .register(
                Service::new("Foo")
                    .unwrap()
                    .method("Sum", |args: SumArgs| async move {
                        Ok(args.num1 + args.num2)
                    })
                    .unwrap(),
            )
            .unwrap();
        Arc::new(server)
    }

    /// Runs a server over an in-memory stream and returns the client side
    /// split into reader/writer.
    fn connect(server: Arc<Server>) -> (FrameWriter, FrameReader) {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let (srv_read, srv_write) = tokio::io::split(server_side);
        tokio::spawn(
            server.serve_transport(FrameReader::new(srv_read), FrameWriter::new(srv_write)),
        );
        let (cli_read, cli_write) = tokio::io::split(client);
        (FrameWriter::new(cli_write), FrameReader::new(cli_read))
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let server = Server::new();
        server.register(Service::new("Foo").unwrap()).unwrap();
        let err = server.register(Service::new("Foo").unwrap()).unwrap_err();
        assert!(err.to_string().contains("service already defined"));
    }

    #[test]
    fn find_method_errors_are_descriptive() {
        let server = test_server();
        assert!(matches!(
            server.find_method("FooSum"),
            Err(RpcError::IllFormedMethod(_))
        ));
        assert!(matches!(
            server.find_method("Bar.Sum"),
            Err(RpcError::ServiceNotFound(_))
        ));
        assert!(matches!(
            server.find_method("Foo.Missing"),
            Err(RpcError::MethodNotFound(_))
        ));
    }

    #[tokio::test]
    async fn serves_a_request_over_the_negotiated_codec() {
        for kind in [CodecKind::Binary, CodecKind::Json] {
            let (mut w, mut r) = connect(test_server());
            let options = Options::new().with_codec(kind);
            w.write_message(CodecKind::Json, &options).await.unwrap();
            w.write_frame(kind, &Header::request("Foo.Sum", 1), &SumArgs { num1: 2, num2: 3 })
                .await
                .unwrap();

            let header = r.read_header(kind).await.unwrap();
            assert_eq!(header.seq, 1);
            assert!(header.error.is_empty());
            let reply: i32 = r.read_payload(kind).await.unwrap().decode().unwrap();
            assert_eq!(reply, 5);
        }
    }

    #[tokio::test]
    async fn bad_magic_closes_without_a_response() {
        let server = test_server();
        let (client, server_side) = tokio::io::duplex(4096);
        let (srv_read, srv_write) = tokio::io::split(server_side);
        tokio::spawn(
            server.serve_transport(FrameReader::new(srv_read), FrameWriter::new(srv_write)),
        );

        let (mut cli_read, cli_write) = tokio::io::split(client);
        let mut w = FrameWriter::new(cli_write);
        let mut options = Options::new();
        options.magic = 0xdead_beef;
        w.write_message(CodecKind::Json, &options).await.unwrap();

        let mut buf = Vec::new();
        cli_read.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn unknown_codec_closes_without_a_response() {
        let server = test_server();
        let (client, server_side) = tokio::io::duplex(4096);
        let (srv_read, srv_write) = tokio::io::split(server_side);
        tokio::spawn(
            server.serve_transport(FrameReader::new(srv_read), FrameWriter::new(srv_write)),
        );

        let (mut cli_read, cli_write) = tokio::io::split(client);
        let mut w = FrameWriter::new(cli_write);
        let mut options = Options::new();
        options.codec_type = "application/gob".to_string();
        w.write_message(CodecKind::Json, &options).await.unwrap();

        let mut buf = Vec::new();
        cli_read.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn unknown_method_is_reported_and_connection_survives() {
        let kind = CodecKind::Binary;
        let (mut w, mut r) = connect(test_server());
        w.write_message(CodecKind::Json, &Options::new()).await.unwrap();

        w.write_frame(kind, &Header::request("Foo.Missing", 1), &SumArgs { num1: 0, num2: 0 })
            .await
            .unwrap();
        let header = r.read_header(kind).await.unwrap();
        assert_eq!(header.seq, 1);
        assert!(header.error.contains("can't find method Missing"));
        let _ = r.read_payload(kind).await.unwrap();

        // Same connection keeps working.
        w.write_frame(kind, &Header::request("Foo.Sum", 2), &SumArgs { num1: 4, num2: 6 })
            .await
            .unwrap();
        let header = r.read_header(kind).await.unwrap();
        assert_eq!(header.seq, 2);
        assert!(header.error.is_empty());
        let reply: i32 = r.read_payload(kind).await.unwrap().decode().unwrap();
        assert_eq!(reply, 10);
    }

    #[tokio::test]
    async fn handle_timeout_sends_synthetic_error() {
        let server = Server::new();
        server
            .register(
                Service::new("Slow")
                    .unwrap()
                    .method("Nap", |_: Empty| async move {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        Ok(0i32)
                    })
                    .unwrap(),
            )
            .unwrap();

        let kind = CodecKind::Json;
        let (mut w, mut r) = connect(Arc::new(server));
        let options = Options::new()
            .with_codec(kind)
            .with_handle_timeout(Duration::from_millis(50));
        w.write_message(CodecKind::Json, &options).await.unwrap();
        w.write_frame(kind, &Header::request("Slow.Nap", 1), &Empty {})
            .await
            .unwrap();

        let header = r.read_header(kind).await.unwrap();
        assert!(header.error.contains("request handle timeout: expect within"));
        let _ = r.read_payload(kind).await.unwrap();
    }

    #[tokio::test]
    async fn counters_visible_through_the_server() {
        let server = test_server();
        let kind = CodecKind::Json;
        let (mut w, mut r) = connect(Arc::clone(&server));
        w.write_message(CodecKind::Json, &Options::new().with_codec(kind))
            .await
            .unwrap();
        w.write_frame(kind, &Header::request("Foo.Sum", 1), &SumArgs { num1: 1, num2: 2 })
            .await
            .unwrap();
        let _ = r.read_header(kind).await.unwrap();
        let _ = r.read_payload(kind).await.unwrap();

        assert_eq!(server.method_calls("Foo.Sum"), Some(1));
        assert_eq!(server.method_calls("Foo.Missing"), None);
    }
}
