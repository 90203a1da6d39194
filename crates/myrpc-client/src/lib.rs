//! MyRPC Client
//!
//! The calling half of MyRPC: a connection-multiplexed [`Client`], service
//! [`discovery`] with pluggable selection, a consistent-hash [`HashRing`],
//! and the load-balancing [`XClient`].
//!
//! # Example
//!
//! ```no_run
//! use myrpc_client::Client;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { num1: i32, num2: i32 }
//!
//! # async fn run() -> myrpc_common::Result<()> {
//! let client = Client::xdial("tcp@127.0.0.1:12345").await?;
//! let sum: i32 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod discovery;
pub mod ring;
pub mod xclient;

pub use client::{Client, PendingCall};
pub use discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};
pub use ring::HashRing;
pub use xclient::XClient;
