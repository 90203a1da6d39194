//! MyRPC Server
//!
//! The serving half of MyRPC: register services, then hand the server a
//! listener. Per connection the server validates the JSON preamble (magic
//! number, codec identifier), then reads `(Header, Body)` frames, dispatching
//! each request on its own task while the reader moves on to the next frame.
//! Responses are serialized by a per-connection send mutex; an optional
//! handle timeout bounds every dispatch and reports
//! `request handle timeout: expect within <d>` in the response header.
//!
//! # Components
//!
//! - [`Service`] / [`service::Method`] - typed method registration, erased
//!   dispatch, per-method call counters
//! - [`Server`] - service registry, TCP accept loop, connection loop, and the
//!   HTTP `CONNECT` transport

pub mod server;
pub mod service;

mod http;

pub use server::Server;
pub use service::Service;
