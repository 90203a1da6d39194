//! MyRPC Registry
//!
//! A process-local service registry exposed over HTTP. Servers POST
//! heartbeats carrying their address in the `X-Myrpc-Server` header; clients
//! GET the alive set back as a sorted, comma-separated `X-Myrpc-Servers`
//! header. Entries whose last heartbeat is older than the registry timeout
//! are evicted when the alive set is computed. Nothing is persisted: a
//! registry restart forgets every server.
//!
//! # Components
//!
//! - [`Registry`] - the table plus its axum router
//! - [`heartbeat`] - the server-side periodic heartbeat task

pub mod heartbeat;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

use myrpc_common::protocol::{DEFAULT_REGISTRY_PATH, SERVERS_HEADER, SERVER_HEADER};
use myrpc_common::{Result, RpcError};

/// Registrations expire after this long without a heartbeat.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One registered server.
#[derive(Debug, Clone)]
struct ServerItem {
    start: Instant,
}

/// The heartbeat table.
///
/// All mutations go through one mutex; the alive-set computation evicts
/// expired entries as a side effect, so the table never grows past the set of
/// servers seen within one timeout window.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, ServerItem>>,
}

impl Registry {
    /// A registry whose entries expire after `timeout`. Zero disables
    /// expiry.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Upserts a server, refreshing its heartbeat timestamp.
    fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().expect("registry table poisoned");
        servers.insert(addr.to_string(), ServerItem { start: Instant::now() });
        debug!(addr, "heartbeat");
    }

    /// The alive set, sorted ascending. Expired entries are evicted.
    pub fn alive_servers(&self) -> Vec<String> {
        let now = Instant::now();
        let mut servers = self.servers.lock().expect("registry table poisoned");
        let mut alive = Vec::with_capacity(servers.len());
        servers.retain(|addr, item| {
            if self.timeout.is_zero() || item.start + self.timeout > now {
                alive.push(addr.clone());
                true
            } else {
                false
            }
        });
        alive.sort();
        alive
    }

    /// The HTTP surface: GET for the alive list, POST for heartbeats.
    /// Anything else gets a 405 from the method router.
    pub fn router(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, get(list_servers).post(receive_heartbeat))
            .with_state(self)
    }

    /// Serves the registry on its default path until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| RpcError::Registry(e.to_string()))?;
        info!(%addr, path = DEFAULT_REGISTRY_PATH, "registry listening");
        axum::serve(listener, self.router(DEFAULT_REGISTRY_PATH))
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))
    }

    /// Binds an ephemeral port and serves in the background; returns the
    /// bound address.
    pub async fn spawn(self: Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(RpcError::Io)?;
        let addr = listener.local_addr().map_err(RpcError::Io)?;
        tokio::spawn(async move {
            let _ = self.serve(listener).await;
        });
        Ok(addr)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let alive = registry.alive_servers().join(",");
    ([(SERVERS_HEADER, alive)], StatusCode::OK)
}

async fn receive_heartbeat(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    match headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|addr| !addr.is_empty())
    {
        Some(addr) => {
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
