//! Server-side heartbeats.
//!
//! A serving process calls [`start`] with the registry URL and its own
//! advertised address. One beat is sent immediately; after that the task
//! beats on a fixed period and stops on the first failure, at which point the
//! registry will age the entry out.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use myrpc_common::protocol::SERVER_HEADER;
use myrpc_common::{Result, RpcError};

use crate::DEFAULT_TIMEOUT;

/// How much earlier than the registry timeout a beat is sent by default.
const PERIOD_MARGIN: Duration = Duration::from_secs(60);

/// Sends one heartbeat POST.
pub async fn send_heartbeat(
    client: &reqwest::Client,
    registry_url: &str,
    addr: &str,
) -> Result<()> {
    info!(addr, registry_url, "send heartbeat");
    client
        .post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| RpcError::Registry(e.to_string()))?;
    Ok(())
}

/// Starts the periodic heartbeat task.
///
/// `period` defaults to one minute less than the registry's default timeout
/// (and never below zero). The first beat is sent before this returns a
/// running task; the task exits on the first failed beat.
pub fn start(
    registry_url: impl Into<String>,
    addr: impl Into<String>,
    period: Option<Duration>,
) -> JoinHandle<()> {
    let registry_url = registry_url.into();
    let addr = addr.into();
    let period = period.unwrap_or_else(|| DEFAULT_TIMEOUT.saturating_sub(PERIOD_MARGIN));

    tokio::spawn(async move {
        let client = reqwest::Client::new();
        loop {
            if let Err(e) = send_heartbeat(&client, &registry_url, &addr).await {
                warn!(addr, "heartbeat failed, stopping: {}", e);
                return;
            }
            tokio::time::sleep(period).await;
        }
    })
}
