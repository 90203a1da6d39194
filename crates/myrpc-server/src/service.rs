//! Service descriptors and the typed-to-erased dispatch seam.
//!
//! A [`Service`] maps an exported name to a set of named methods. Methods are
//! registered as typed async closures `Fn(Args) -> anyhow::Result<Reply>`;
//! registration erases them behind a uniform handler signature so the
//! connection loop can invoke any method given only its wire name, the
//! decoded argument payload, and the connection's codec.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use myrpc_common::{CodecKind, Payload, Result, RpcError};

/// Erased method body: decode args, run, encode the reply in the
/// connection's codec. The error string becomes `Header.error`.
type HandlerFn = Box<
    dyn Fn(Payload, CodecKind) -> BoxFuture<'static, std::result::Result<Payload, String>>
        + Send
        + Sync,
>;

/// One invocable method: its erased handler plus an invocation counter.
pub struct Method {
    name: String,
    calls: AtomicU64,
    handler: HandlerFn,
}

impl Method {
    /// Runs the handler. The counter is bumped before dispatch.
    pub(crate) async fn dispatch(
        &self,
        args: Payload,
        kind: CodecKind,
    ) -> std::result::Result<Payload, String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(args, kind).await
    }

    /// How many times this method has been dispatched.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A named bundle of methods, registered on a [`Server`](crate::Server).
///
/// Service and method names must be exported: first character uppercase.
/// The full wire name of a method is `"Service.Method"`.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_exported(&name) {
            return Err(RpcError::InvalidService(format!(
                "{} is not a valid service name",
                name
            )));
        }
        Ok(Self {
            name,
            methods: HashMap::new(),
        })
    }

    /// Registers a method under this service.
    ///
    /// The handler receives the decoded argument and returns the reply; an
    /// `Err` is delivered to the caller as the response's error string.
    /// Argument and reply types only need `Deserialize`/`Serialize` — the
    /// signature shape the wire requires is enforced here, at compile time.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Result<Self>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        if !is_exported(name) {
            return Err(RpcError::InvalidService(format!(
                "{} is not a valid method name",
                name
            )));
        }
        if self.methods.contains_key(name) {
            return Err(RpcError::InvalidService(format!(
                "method already defined: {}.{}",
                self.name, name
            )));
        }

        let handler = Arc::new(handler);
        let erased: HandlerFn = Box::new(move |args: Payload, kind: CodecKind| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: A = args
                    .decode()
                    .map_err(|e| format!("invalid argument: {}", e))?;
                let reply = handler(args).await.map_err(|e| e.to_string())?;
                kind.encode(&reply)
                    .map_err(|e| format!("encode reply: {}", e))
            })
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                name: format!("{}.{}", self.name, name),
                calls: AtomicU64::new(0),
                handler: erased,
            }),
        );
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn get(&self, method: &str) -> Option<Arc<Method>> {
        self.methods.get(method).cloned()
    }
}

/// Splits `"Service.Method"` on the last dot.
pub(crate) fn split_service_method(service_method: &str) -> Result<(&str, &str)> {
    service_method
        .rsplit_once('.')
        .ok_or_else(|| RpcError::IllFormedMethod(service_method.to_string()))
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}
