//! Bridge client against a real WebSocket peer on an ephemeral port.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{SECRET, spawn_peer};
use ironloop::bridge::{BridgeClient, BridgeConfig, BridgeError, ConnectionState, collect_tools};
use secrecy::SecretString;
use serde_json::json;

fn config() -> BridgeConfig {
    BridgeConfig {
        auth_timeout: Duration::from_secs(2),
        reconnect_base_delay: Duration::from_millis(10),
        ..BridgeConfig::default()
    }
}

async fn connected() -> BridgeClient {
    let url = spawn_peer().await.url;
    let client = BridgeClient::new(config());
    client
        .connect(&url, SecretString::from(SECRET))
        .await
        .unwrap();
    client
}

async fn wait_for_pending(client: &BridgeClient, count: usize) {
    for _ in 0..100 {
        if client.pending_count().await >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("request never registered");
}

#[tokio::test]
async fn test_auth_and_tool_discovery() {
    let client = connected().await;
    assert!(client.is_connected());

    let tools = collect_tools(&client).await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.tool.name.as_str()).collect();
    assert_eq!(names, vec!["read_file", "delete_file"]);
    assert!(tools.iter().all(|t| t.server_id == "fs"));

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let url = spawn_peer().await.url;
    let client = BridgeClient::new(config());

    let err = client
        .connect(&url, SecretString::from("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::AuthFailed(ref m) if m == "bad secret"));
    assert!(!client.is_connected());
    assert!(client.last_error().await.is_some());
}

#[tokio::test]
async fn test_unreachable_peer_fails_to_connect() {
    let client = BridgeClient::new(config());
    let err = client
        .connect("ws://127.0.0.1:1", SecretString::from(SECRET))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectFailed { .. }));
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let client = connected().await;

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.call("fs", "slow", json!({"n": 1}), None).await })
    };
    wait_for_pending(&client, 1).await;

    let fast = client
        .call("fs", "fast", json!({"n": 2}), None)
        .await
        .unwrap();
    let slow = slow.await.unwrap().unwrap();

    assert_eq!(fast["tool"], "fast");
    assert_eq!(fast["arguments"]["n"], 2);
    assert_eq!(slow["tool"], "slow");
    assert_eq!(slow["arguments"]["n"], 1);
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn test_tool_error_and_timeout() {
    let client = connected().await;

    let err = client
        .call("fs", "fail", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ToolFailed { ref message, .. } if message == "disk full"));
    assert!(!err.is_transport());

    let err = client
        .call("fs", "hang", json!({}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn test_disconnect_mid_call_rejects_then_reconnects() {
    let client = connected().await;
    let mut state = client.subscribe_state();

    let held = {
        let client = client.clone();
        tokio::spawn(async move { client.call("fs", "slow", json!({}), None).await })
    };
    wait_for_pending(&client, 1).await;

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        client.call("fs", "hangup", json!({}), None),
    )
    .await
    .expect("call should be rejected promptly")
    .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionLost));

    let err = tokio::time::timeout(Duration::from_secs(2), held)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionLost));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let result = client.call("fs", "ping", json!({}), None).await.unwrap();
    assert_eq!(result["tool"], "ping");
}

#[tokio::test]
async fn test_reconnect_gives_up_after_ceiling() {
    let client = connected().await;
    let mut state = client.subscribe_state();

    let err = client
        .call("fs", "shutdown", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionLost));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, ConnectionState::Failed { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(
        client.last_error().await,
        Some(BridgeError::ReconnectExhausted { attempts: 5, .. })
    ));
    assert!(matches!(
        client.call("fs", "ping", json!({}), None).await,
        Err(BridgeError::NotConnected)
    ));
}

#[tokio::test]
async fn test_generic_request_and_handlers() {
    let client = connected().await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let handler = client
        .on("echo", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    let next = client.once("echo").await;

    let reply = client
        .request(json!({"type": "ping", "note": "hi"}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply.kind(), "echo");
    assert_eq!(reply.get("payload").unwrap()["note"], "hi");

    let once = next.await.unwrap();
    assert_eq!(once.correlation_id(), reply.correlation_id());
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    assert!(client.off(handler).await);
    client
        .request(json!({"type": "ping"}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_explicit_disconnect_fails_pending_calls() {
    let client = connected().await;

    let held = {
        let client = client.clone();
        tokio::spawn(async move { client.call("fs", "slow", json!({}), None).await })
    };
    wait_for_pending(&client, 1).await;

    client.disconnect().await;
    let err = held.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionLost));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
