//! Service discovery and endpoint selection.
//!
//! [`MultiServersDiscovery`] serves a hand-maintained list;
//! [`RegistryDiscovery`] layers TTL-gated refreshes from the heartbeat
//! registry on top of it. Selection state (the round-robin cursor and the
//! RNG) lives with the list, so `get` takes the write half of the lock while
//! `get_all` shares the read half.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use myrpc_common::protocol::SERVERS_HEADER;
use myrpc_common::{Result, RpcError};

/// How an endpoint is picked out of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
    /// Served by [`HashRing`](crate::HashRing), not by the list discoveries.
    ConsistentHash,
}

/// Source of RPC endpoints for an [`XClient`](crate::XClient).
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-reads the backing source, if there is one.
    async fn refresh(&self) -> Result<()>;
    /// Replaces the list.
    async fn update(&self, servers: Vec<String>) -> Result<()>;
    /// Picks one endpoint.
    async fn get(&self, mode: SelectMode) -> Result<String>;
    /// Returns every endpoint.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct ListState {
    servers: Vec<String>,
    /// Round-robin cursor. Starts at a random value so a fleet of fresh
    /// clients does not hammer the first server in the list.
    index: usize,
    rng: StdRng,
}

/// Discovery over a hand-maintained endpoint list.
pub struct MultiServersDiscovery {
    state: RwLock<ListState>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        let index = rng.gen_range(0..i32::MAX as usize - 1);
        Self {
            state: RwLock::new(ListState { servers, index, rng }),
        }
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    /// Nothing to refresh; the list is maintained by hand.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.state.write().await.servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.write().await;
        let n = state.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let pick = state.rng.gen_range(0..n);
                Ok(state.servers[pick].clone())
            }
            SelectMode::RoundRobin => {
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
            SelectMode::ConsistentHash => Err(RpcError::UnsupportedSelectMode),
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.servers.clone())
    }
}

/// List freshness window for [`RegistryDiscovery`].
pub const DEFAULT_UPDATE_TTL: Duration = Duration::from_secs(10);

/// Discovery backed by the heartbeat registry.
///
/// `get`/`get_all` refresh first; a refresh inside the TTL is a no-op, so
/// steady-state selection costs one mutex check.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry_url: String,
    ttl: Duration,
    /// Held across the whole GET so concurrent refreshes collapse into one.
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `ttl` defaults to [`DEFAULT_UPDATE_TTL`].
    pub fn new(registry_url: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            ttl: ttl.unwrap_or(DEFAULT_UPDATE_TTL),
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        if let Some(last) = *last_update {
            if last + self.ttl > Instant::now() {
                return Ok(());
            }
        }

        debug!(registry = %self.registry_url, "refresh servers from registry");
        let response = self
            .http
            .get(&self.registry_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| RpcError::Registry(e.to_string()))?;
        let servers = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();

        self.servers.update(servers).await?;
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.update(servers).await?;
        *self.last_update.lock().await = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}
