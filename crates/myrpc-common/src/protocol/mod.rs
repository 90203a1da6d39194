//! Wire protocol types.
//!
//! Every connection carries a JSON-encoded [`Options`] preamble followed by
//! `(Header, Body)` frames in the codec the preamble selected:
//!
//! ```text
//! | Options (JSON) | Header (codec) | Body (codec) | Header | Body | ...
//! ```
//!
//! The preamble is always JSON so that bootstrap never depends on the codec
//! it is negotiating.

pub mod error;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x7977_9200;

/// Path served by the HTTP `CONNECT` transport.
pub const DEFAULT_RPC_PATH: &str = "/_myrpc_";

/// Status line body sent after a successful `CONNECT` handshake.
pub const CONNECTED: &str = "200 Connected to MyRPC";

/// Default path for the heartbeat registry endpoint.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc_/registry";

/// Request header carrying a server address on registry POSTs.
pub const SERVER_HEADER: &str = "X-Myrpc-Server";

/// Response header carrying the alive-server list on registry GETs.
pub const SERVERS_HEADER: &str = "X-Myrpc-Servers";

/// Negotiation preamble, exchanged once per connection.
///
/// The magic number is always the compiled-in [`MAGIC_NUMBER`]; the builder
/// methods deliberately offer no way to change it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Options {
    /// Identifies this protocol; connections with any other value are dropped.
    pub magic: u32,
    /// Wire identifier of the body codec, resolved via [`CodecKind::from_name`].
    pub codec_type: String,
    /// Dial + negotiation deadline in milliseconds; 0 waits indefinitely.
    #[serde(default)]
    pub connect_timeout_ms: u64,
    /// Server-side per-request deadline in milliseconds; 0 runs unbounded.
    #[serde(default)]
    pub handle_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic: MAGIC_NUMBER,
            codec_type: CodecKind::Binary.name().to_string(),
            connect_timeout_ms: 10_000,
            handle_timeout_ms: 0,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the body codec.
    pub fn with_codec(mut self, kind: CodecKind) -> Self {
        self.codec_type = kind.name().to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Connect timeout; `None` means wait indefinitely.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Handle timeout; `None` means handlers run unbounded.
    pub fn handle_timeout(&self) -> Option<Duration> {
        match self.handle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Per-message header, one per request and one per response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    /// Fully-qualified method, `"Service.Method"`.
    pub service_method: String,
    /// Correlates a response with its request; assigned by the client,
    /// strictly increasing from 1.
    pub seq: u64,
    /// Empty on success; otherwise the error reported by the server.
    #[serde(default)]
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }
}

/// Placeholder body for responses that only carry a header error.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Empty {}
