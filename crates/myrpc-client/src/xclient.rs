//! Load-balancing client.
//!
//! An `XClient` pools one [`Client`] per endpoint, asks its [`Discovery`] for
//! addresses, and offers unicast [`call`](XClient::call) plus
//! [`broadcast`](XClient::broadcast) to every endpoint at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use myrpc_common::{Options, Result, RpcError};

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};

/// A client that spreads calls over the endpoints a [`Discovery`] reports.
///
/// Pooled clients are keyed by the full `"protocol@address"` string; a pooled
/// client that went unavailable is closed and replaced on next use.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Client>>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: Options) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Closes every pooled client and empties the pool.
    pub async fn close(&self) {
        let drained: Vec<Client> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in drained {
            let _ = client.close().await;
        }
    }

    /// Returns a pooled client for the endpoint, dialing if needed.
    ///
    /// The pool mutex is never held across the dial; when two tasks race to
    /// dial the same endpoint, the loser's connection is closed and the
    /// winner's is shared.
    async fn dial(&self, rpc_addr: &str) -> Result<Client> {
        {
            let mut clients = self.clients.lock().await;
            if let Some(client) = clients.get(rpc_addr) {
                if client.is_available() {
                    return Ok(client.clone());
                }
                let stale = clients.remove(rpc_addr);
                if let Some(stale) = stale {
                    let _ = stale.close().await;
                }
            }
        }

        debug!(rpc_addr, "dialing endpoint");
        let client = Client::xdial_with(rpc_addr, self.options.clone()).await?;

        let mut clients = self.clients.lock().await;
        match clients.get(rpc_addr) {
            Some(existing) if existing.is_available() => {
                let existing = existing.clone();
                drop(clients);
                let _ = client.close().await;
                Ok(existing)
            }
            _ => {
                clients.insert(rpc_addr.to_string(), client.clone());
                Ok(client)
            }
        }
    }

    async fn call_addr<A, R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let client = self.dial(rpc_addr).await?;
        match timeout {
            Some(limit) => client.call_with_timeout(service_method, args, limit).await,
            None => client.call(service_method, args).await,
        }
    }

    /// Calls one endpoint, chosen by the configured select mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        self.call_addr(&rpc_addr, service_method, args, None).await
    }

    /// Calls every known endpoint in parallel.
    ///
    /// The first successful reply wins; once any endpoint succeeds the final
    /// result is `Ok` no matter what the others do. The first error cancels
    /// the calls still in flight. `timeout` bounds each per-endpoint call.
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;
        let cancel = CancellationToken::new();
        let outcome: StdMutex<(Option<R>, Option<RpcError>)> = StdMutex::new((None, None));

        let calls = servers.into_iter().map(|rpc_addr| {
            let cancel = cancel.clone();
            let outcome = &outcome;
            async move {
                // Each endpoint decodes into its own fresh reply value.
                let result: Result<R> = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.call_addr(&rpc_addr, service_method, args, timeout) => result,
                };
                let mut outcome = outcome.lock().expect("broadcast state poisoned");
                match result {
                    Ok(reply) => {
                        if outcome.0.is_none() {
                            outcome.0 = Some(reply);
                        }
                    }
                    Err(e) => {
                        if outcome.1.is_none() {
                            debug!(rpc_addr = %rpc_addr, "broadcast error: {}", e);
                            outcome.1 = Some(e);
                            cancel.cancel();
                        }
                    }
                }
            }
        });
        futures::future::join_all(calls).await;

        let (reply, error) = outcome.into_inner().expect("broadcast state poisoned");
        match (reply, error) {
            (Some(reply), _) => Ok(reply),
            (None, Some(error)) => Err(error),
            (None, None) => Err(RpcError::NoAvailableServers),
        }
    }
}
