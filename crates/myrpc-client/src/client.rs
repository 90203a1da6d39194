//! The multiplexing RPC client.
//!
//! One `Client` owns one connection. Callers issue concurrent calls; each is
//! assigned a sequence number under the send lock (so seqs hit the wire in
//! order), parked in the pending table, and completed by the single receive
//! task when the matching response header arrives.
//!
//! Lock order is send → state: `go` holds the writer mutex while it registers
//! the call, and `terminate_calls` takes the writer mutex before the state
//! mutex when it fails everything at shutdown. The state mutex is never held
//! across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use myrpc_common::protocol::{CONNECTED, DEFAULT_RPC_PATH};
use myrpc_common::{
    CodecKind, FrameReader, FrameWriter, Header, Options, Payload, Result, RpcError, MAGIC_NUMBER,
};

type CallResult = std::result::Result<Payload, RpcError>;

struct State {
    /// Next sequence number; starts at 1, 0 is never a valid seq.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallResult>>,
    /// User asked for close.
    closing: bool,
    /// The receive loop died.
    shutdown: bool,
}

struct Shared {
    kind: CodecKind,
    /// The send lock. Held for the whole header+body write.
    writer: AsyncMutex<FrameWriter>,
    /// The state lock.
    state: Mutex<State>,
    /// Unblocks the receive loop on user-initiated close.
    cancel: CancellationToken,
}

impl Shared {
    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallResult>> {
        self.state
            .lock()
            .expect("client state poisoned")
            .pending
            .remove(&seq)
    }

    /// Fails every pending call and marks the client shut down.
    ///
    /// `reason` is `None` for a user-initiated close.
    async fn terminate_calls(&self, reason: Option<RpcError>) {
        let _writer = self.writer.lock().await;
        let mut state = self.state.lock().expect("client state poisoned");
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let err = match &reason {
                None => RpcError::Shutdown,
                Some(e) => RpcError::ConnectionLost(e.to_string()),
            };
            let _ = tx.send(Err(err));
        }
    }
}

/// A call that has been written to the wire but not yet answered.
///
/// Await it with [`wait`](Self::wait). Dropping it instead cancels the call
/// client-side: the pending entry is removed, the connection is untouched,
/// and the response — if the server still sends one — is silently drained.
pub struct PendingCall {
    seq: u64,
    service_method: String,
    rx: oneshot::Receiver<CallResult>,
    shared: Weak<Shared>,
    completed: bool,
}

impl PendingCall {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Waits for the response and decodes the reply.
    pub async fn wait<R: DeserializeOwned>(mut self) -> Result<R> {
        let outcome = (&mut self.rx).await;
        self.completed = true;
        match outcome {
            Ok(Ok(payload)) => payload.decode(),
            Ok(Err(e)) => Err(e),
            // Sender dropped without completing: the client is gone.
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.completed {
            if let Some(shared) = self.shared.upgrade() {
                shared.remove_call(self.seq);
            }
        }
    }
}

/// A connection-multiplexed RPC client. Cheap to clone; all clones share the
/// connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dials a TCP endpoint with default options.
    pub async fn dial(addr: &str) -> Result<Client> {
        Self::dial_with(addr, Options::new()).await
    }

    /// Dials a TCP endpoint.
    ///
    /// The connect timeout bounds both the TCP connect and the negotiation;
    /// zero waits indefinitely. The options' magic number is replaced with
    /// the compiled-in one unconditionally.
    pub async fn dial_with(addr: &str, options: Options) -> Result<Client> {
        let options = stamp_magic(options);
        let stream = connect_within(addr, options.connect_timeout()).await?;
        let (read_half, write_half) = stream.into_split();
        negotiate_within(
            FrameReader::new(read_half),
            FrameWriter::new(write_half),
            options,
        )
        .await
    }

    /// Dials over the HTTP `CONNECT` transport with default options.
    pub async fn dial_http(addr: &str) -> Result<Client> {
        Self::dial_http_with(addr, Options::new()).await
    }

    /// Dials over the HTTP `CONNECT` transport.
    pub async fn dial_http_with(addr: &str, options: Options) -> Result<Client> {
        let options = stamp_magic(options);
        let timeout = options.connect_timeout();
        let stream = connect_within(addr, timeout).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let handshake = async {
            let connect = format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH);
            writer.write_raw(connect.as_bytes()).await?;
            let head = reader.read_http_head().await?;
            let status = head.lines().next().unwrap_or("").trim();
            let expected = format!("HTTP/1.0 {}", CONNECTED);
            if status != expected {
                return Err(RpcError::HttpHandshake(status.to_string()));
            }
            negotiate(reader, writer, options).await
        };
        within(timeout, handshake).await
    }

    /// Dials a Unix socket endpoint.
    #[cfg(unix)]
    pub async fn dial_unix_with(path: &str, options: Options) -> Result<Client> {
        let options = stamp_magic(options);
        let timeout = options.connect_timeout();
        let connect = tokio::net::UnixStream::connect(path);
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| RpcError::ConnectTimeout(limit))??,
            None => connect.await?,
        };
        let (read_half, write_half) = stream.into_split();
        negotiate_within(
            FrameReader::new(read_half),
            FrameWriter::new(write_half),
            options,
        )
        .await
    }

    /// Unified dial on a `"<protocol>@<address>"` string: `http` uses the
    /// `CONNECT` transport, `tcp` (and `unix` on Unix targets) dial directly.
    pub async fn xdial(rpc_addr: &str) -> Result<Client> {
        Self::xdial_with(rpc_addr, Options::new()).await
    }

    pub async fn xdial_with(rpc_addr: &str, options: Options) -> Result<Client> {
        let Some((protocol, addr)) = rpc_addr.split_once('@') else {
            return Err(RpcError::InvalidAddress(rpc_addr.to_string()));
        };
        match protocol {
            "http" => Self::dial_http_with(addr, options).await,
            "tcp" => Self::dial_with(addr, options).await,
            #[cfg(unix)]
            "unix" => Self::dial_unix_with(addr, options).await,
            other => Err(RpcError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// True until `close` is called or the receive loop dies.
    pub fn is_available(&self) -> bool {
        let state = self.shared.state.lock().expect("client state poisoned");
        !state.closing && !state.shutdown
    }

    /// Closes the connection. Every pending call fails with the shutdown
    /// error; a second close reports it too.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("client state poisoned");
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.shared.cancel.cancel();
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    /// Starts a call and returns a handle to await.
    ///
    /// Holding the send lock across registration and the write keeps
    /// sequence numbers strictly increasing on the wire.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Result<PendingCall> {
        let shared = &self.shared;
        let mut writer = shared.writer.lock().await;
        let (seq, rx) = {
            let mut state = shared.state.lock().expect("client state poisoned");
            if state.closing || state.shutdown {
                return Err(RpcError::Shutdown);
            }
            let seq = state.seq;
            state.seq += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(seq, tx);
            (seq, rx)
        };

        let header = Header::request(service_method, seq);
        if let Err(e) = writer.write_frame(shared.kind, &header, args).await {
            // A failed write leaves the stream in an unknown state; tear the
            // connection down rather than risk interleaved garbage.
            shared.remove_call(seq);
            shared.cancel.cancel();
            return Err(e);
        }
        debug!(service_method, seq, "request sent");

        Ok(PendingCall {
            seq,
            service_method: service_method.to_string(),
            rx,
            shared: Arc::downgrade(shared),
            completed: false,
        })
    }

    /// Calls a remote method and waits for its reply.
    ///
    /// Cancellation is dropping the returned future (for example via
    /// `tokio::time::timeout`): the pending entry is removed and a late
    /// response is drained, leaving the connection usable.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        self.go(service_method, args).await?.wait().await
    }

    /// [`call`](Self::call) bounded by a deadline.
    pub async fn call_with_timeout<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
        limit: Duration,
    ) -> Result<R> {
        match tokio::time::timeout(limit, self.call(service_method, args)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::CallTimeout(limit)),
        }
    }
}

fn stamp_magic(mut options: Options) -> Options {
    // Callers cannot speak for another protocol.
    options.magic = MAGIC_NUMBER;
    options
}

async fn connect_within(addr: &str, timeout: Option<Duration>) -> Result<TcpStream> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::ConnectTimeout(limit))?
            .map_err(RpcError::Io),
        None => TcpStream::connect(addr).await.map_err(RpcError::Io),
    }
}

async fn within<F>(timeout: Option<Duration>, fut: F) -> Result<Client>
where
    F: std::future::Future<Output = Result<Client>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RpcError::ConnectTimeout(limit))?,
        None => fut.await,
    }
}

async fn negotiate_within(
    reader: FrameReader,
    writer: FrameWriter,
    options: Options,
) -> Result<Client> {
    let timeout = options.connect_timeout();
    within(timeout, negotiate(reader, writer, options)).await
}

/// Writes the preamble and brings up the receive loop.
async fn negotiate(
    reader: FrameReader,
    mut writer: FrameWriter,
    options: Options,
) -> Result<Client> {
    let Some(kind) = CodecKind::from_name(&options.codec_type) else {
        return Err(RpcError::InvalidCodec(options.codec_type));
    };
    writer.write_message(CodecKind::Json, &options).await?;

    let shared = Arc::new(Shared {
        kind,
        writer: AsyncMutex::new(writer),
        state: Mutex::new(State {
            seq: 1,
            pending: HashMap::new(),
            closing: false,
            shutdown: false,
        }),
        cancel: CancellationToken::new(),
    });
    tokio::spawn(receive(Arc::clone(&shared), reader));
    Ok(Client { shared })
}

/// The receive loop: demultiplexes responses by seq until the connection
/// dies, then fails whatever is still pending.
async fn receive(shared: Arc<Shared>, mut reader: FrameReader) {
    let kind = shared.kind;
    let reason = loop {
        let header = tokio::select! {
            _ = shared.cancel.cancelled() => break None,
            header = reader.read_header(kind) => match header {
                Ok(header) => header,
                Err(e) => break Some(e),
            },
        };

        match shared.remove_call(header.seq) {
            // Cancelled client-side, or the request never made it out whole;
            // the server answered anyway. Drain to stay on a boundary.
            None => {
                debug!(seq = header.seq, "response for unknown call drained");
                if let Err(e) = reader.read_payload(kind).await {
                    break Some(e);
                }
            }
            Some(tx) if !header.error.is_empty() => {
                let drained = reader.read_payload(kind).await;
                let _ = tx.send(Err(RpcError::Remote(header.error)));
                if let Err(e) = drained {
                    break Some(e);
                }
            }
            Some(tx) => match reader.read_payload(kind).await {
                Ok(payload) => {
                    let _ = tx.send(Ok(payload));
                }
                Err(e) => {
                    let _ = tx.send(Err(RpcError::Codec(format!("reading body: {}", e))));
                    break Some(e);
                }
            },
        }
    };

    if let Some(e) = &reason {
        if !e.is_disconnect() {
            warn!("receive loop: {}", e);
        }
    }
    shared.terminate_calls(reason).await;
}
