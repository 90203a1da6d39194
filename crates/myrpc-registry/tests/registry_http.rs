//! Registry HTTP surface tests: heartbeat POSTs, alive-set GETs, expiry, and
//! the periodic heartbeat task, all over a real listener.

use std::sync::Arc;
use std::time::Duration;

use myrpc_common::protocol::{DEFAULT_REGISTRY_PATH, SERVERS_HEADER, SERVER_HEADER};
use myrpc_registry::{heartbeat, Registry};

async fn spawn_registry(timeout: Duration) -> String {
    let addr = Arc::new(Registry::new(timeout)).spawn().await.unwrap();
    format!("http://{}{}", addr, DEFAULT_REGISTRY_PATH)
}

async fn get_servers(client: &reqwest::Client, url: &str) -> Vec<String> {
    let response = client.get(url).send().await.unwrap();
    assert!(response.status().is_success());
    let header = response
        .headers()
        .get(SERVERS_HEADER)
        .expect("servers header present")
        .to_str()
        .unwrap();
    header
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn post_then_get_round_trip() {
    let url = spawn_registry(Duration::from_secs(60)).await;
    let client = reqwest::Client::new();

    for addr in ["tcp@127.0.0.1:2222", "tcp@127.0.0.1:1111"] {
        let response = client
            .post(&url)
            .header(SERVER_HEADER, addr)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    // Sorted ascending regardless of registration order.
    assert_eq!(
        get_servers(&client, &url).await,
        vec!["tcp@127.0.0.1:1111", "tcp@127.0.0.1:2222"]
    );
}

#[tokio::test]
async fn post_without_address_header_is_500() {
    let url = spawn_registry(Duration::from_secs(60)).await;
    let client = reqwest::Client::new();
    let response = client.post(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn other_methods_are_405() {
    let url = spawn_registry(Duration::from_secs(60)).await;
    let client = reqwest::Client::new();
    let response = client.delete(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn server_appears_until_its_heartbeat_expires() {
    // Short timeout to keep the test quick; the semantics under test are the
    // ones from the heartbeat scenario: alive iff now < last + timeout.
    let url = spawn_registry(Duration::from_millis(300)).await;
    let client = reqwest::Client::new();

    client
        .post(&url)
        .header(SERVER_HEADER, "tcp@127.0.0.1:9999")
        .send()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(get_servers(&client, &url).await, vec!["tcp@127.0.0.1:9999"]);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(get_servers(&client, &url).await.is_empty());
}

#[tokio::test]
async fn heartbeat_task_keeps_a_server_alive() {
    let url = spawn_registry(Duration::from_millis(400)).await;
    let client = reqwest::Client::new();

    let task = heartbeat::start(&url, "tcp@127.0.0.1:7777", Some(Duration::from_millis(100)));

    // Well past the registry timeout, the periodic beats keep it listed.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(get_servers(&client, &url).await, vec!["tcp@127.0.0.1:7777"]);

    task.abort();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(get_servers(&client, &url).await.is_empty());
}

#[tokio::test]
async fn heartbeat_task_stops_on_first_error() {
    // No registry at this address: the task should send once, fail, and end.
    let task = heartbeat::start(
        "http://127.0.0.1:1/registry",
        "tcp@127.0.0.1:1234",
        Some(Duration::from_millis(50)),
    );
    let finished = tokio::time::timeout(Duration::from_secs(5), task).await;
    assert!(finished.is_ok(), "heartbeat task should stop after an error");
}
