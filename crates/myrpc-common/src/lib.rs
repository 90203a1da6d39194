//! MyRPC Common Types and Wire Codecs
//!
//! Shared foundation for the MyRPC crates: the negotiation preamble and
//! per-message header, the pluggable frame codecs (self-describing CBOR and
//! JSON text), and the error type every component reports.
//!
//! # Wire shape
//!
//! ```text
//! | Options (JSON) | Header (codec) | Body (codec) | Header | Body | ...
//! ```
//!
//! The preamble selects the codec for everything after it, so it is always
//! JSON. Messages are framed by the encodings' own boundaries; there is no
//! length prefix.
//!
//! # Components
//!
//! - [`protocol`] - `Options`, `Header`, wire constants, `RpcError`
//! - [`codec`] - `CodecKind`, `Payload`, `FrameReader`/`FrameWriter`

pub mod codec;
pub mod protocol;

pub use codec::{CodecKind, FrameReader, FrameWriter, Payload};
pub use protocol::error::{Result, RpcError};
pub use protocol::{Empty, Header, Options, MAGIC_NUMBER};
