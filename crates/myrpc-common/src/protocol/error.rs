use std::time::Duration;

use thiserror::Error;

/// Error type shared by every MyRPC crate.
///
/// Per-call failures (`Remote`, `ServiceNotFound`, `MethodNotFound`, typed
/// decode failures surfaced as `Codec`) leave the connection usable;
/// `Io`/`Disconnected`/`ConnectionLost` mean the connection is gone and every
/// pending call on it fails with the same reason.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    /// Clean end of stream between messages.
    #[error("connection closed")]
    Disconnected,

    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("invalid codec type {0}")]
    InvalidCodec(String),

    #[error("service/method request ill-formed: {0}")]
    IllFormedMethod(String),

    #[error("can't find service {0}")]
    ServiceNotFound(String),

    #[error("can't find method {0}")]
    MethodNotFound(String),

    #[error("invalid service definition: {0}")]
    InvalidService(String),

    #[error("service already defined: {0}")]
    ServiceAlreadyDefined(String),

    /// Error string reported by the server in `Header.error`.
    #[error("{0}")]
    Remote(String),

    #[error("connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("call timeout: expect within {0:?}")]
    CallTimeout(Duration),

    #[error("wrong format '{0}', expect protocol@addr")]
    InvalidAddress(String),

    #[error("connection is shut down")]
    Shutdown,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("no available servers")]
    NoAvailableServers,

    #[error("not supported select mode")]
    UnsupportedSelectMode,

    #[error("unsupported protocol {0}, expect protocol@addr")]
    UnsupportedProtocol(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("unexpected HTTP response: {0}")]
    HttpHandshake(String),
}

impl RpcError {
    /// True for errors that end a connection rather than a single call.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_) | RpcError::Disconnected | RpcError::ConnectionLost(_)
        )
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
