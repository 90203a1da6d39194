use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{Result, RpcError};

/// The two body codecs a connection can negotiate.
///
/// Identifiers double as the `codec_type` strings in the [`Options`]
/// preamble; [`CodecKind::from_name`] is the lookup the server performs when
/// validating a preamble, and an unknown identifier aborts the connection.
///
/// [`Options`]: crate::protocol::Options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// Self-describing binary encoding (CBOR). The preferred codec.
    Binary,
    /// JSON text encoding, one value per message.
    Json,
}

impl CodecKind {
    pub const fn name(self) -> &'static str {
        match self {
            CodecKind::Binary => "application/cbor",
            CodecKind::Json => "application/json",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "application/cbor" => Some(CodecKind::Binary),
            "application/json" => Some(CodecKind::Json),
            _ => None,
        }
    }

    /// Serializes a value into one wire message.
    pub fn to_bytes<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Binary => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(value, &mut buf)
                    .map_err(|e| RpcError::Codec(e.to_string()))?;
                Ok(buf)
            }
            CodecKind::Json => {
                let mut buf = serde_json::to_vec(value)?;
                buf.push(b'\n');
                Ok(buf)
            }
        }
    }

    /// Captures a value as a dynamic [`Payload`] in this codec's data model.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Payload> {
        match self {
            CodecKind::Binary => Ok(Payload::Binary(
                ciborium::Value::serialized(value).map_err(|e| RpcError::Codec(e.to_string()))?,
            )),
            CodecKind::Json => Ok(Payload::Json(serde_json::to_value(value)?)),
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One message body, parsed into the codec's dynamic value.
///
/// Bodies cross the dispatch seam type-erased: the receive loop and the
/// server request loop read a `Payload` without knowing the concrete type,
/// and the party that does know (the registered handler, or the caller
/// awaiting a reply) decodes it. Draining a body for framing purposes is
/// reading the `Payload` and dropping it.
#[derive(Debug, Clone)]
pub enum Payload {
    Binary(ciborium::Value),
    Json(serde_json::Value),
}

impl Payload {
    pub fn kind(&self) -> CodecKind {
        match self {
            Payload::Binary(_) => CodecKind::Binary,
            Payload::Json(_) => CodecKind::Json,
        }
    }

    /// Decodes the body into a concrete type.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Payload::Binary(value) => value
                .deserialized()
                .map_err(|e| RpcError::Codec(e.to_string())),
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
        }
    }

    /// Serializes the body back into one wire message.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Binary(value) => CodecKind::Binary.to_bytes(value),
            Payload::Json(value) => CodecKind::Json.to_bytes(value),
        }
    }
}
