//! End-to-end: single replica, directory mode disabled.

use relay::config::RelayConfig;
use relay::directory::{Directory, MemoryDirectory};
use relay::AppState;
use relay_protocol::Envelope;
use relay_test_utils::MockTableClient;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;

async fn start_replica(
    mut config: RelayConfig,
    directory: Arc<dyn Directory>,
) -> (SocketAddr, AppState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.advertise_addr = Some(addr.to_string());
    let state = AppState::new(config, directory);
    state.publish_replica_addr().await;
    let serve_state = state.clone();
    tokio::spawn(async move {
        axum::serve(listener, relay::build_router(serve_state))
            .await
            .unwrap();
    });
    (addr, state)
}

fn local_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.api_keys = vec!["K1".to_owned(), "K2".to_owned()];
    config
}

#[tokio::test]
async fn test_local_search_round_trip() {
    let (addr, _state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let mut ws = MockTableClient::join(&format!("ws://{addr}/relay"), "foundry-A", "K1")
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let request = tokio::spawn(async move {
        http.get(format!("http://{addr}/search"))
            .query(&[("clientId", "foundry-A"), ("query", "stu")])
            .header("x-api-key", "K1")
            .send()
            .await
            .unwrap()
    });

    let command = ws.recv_until("perform-search").await.unwrap();
    assert_eq!(command.get_str("query"), Some("stu"));
    let token = command.request_id.clone().expect("command carries a token");
    assert!(token.starts_with("search_"), "token was {token}");

    let mut payload = Map::new();
    payload.insert("results".to_owned(), json!([{"name": "Studded"}]));
    ws.reply(&token, "search-result", payload).await.unwrap();

    let response = request.await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["results"][0]["name"], "Studded");
}

#[tokio::test]
async fn test_missing_or_unknown_api_key_is_rejected() {
    let (addr, _state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let http = reqwest::Client::new();

    let response = http
        .get(format!("http://{addr}/search"))
        .query(&[("clientId", "foundry-A"), ("query", "stu")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = http
        .get(format!("http://{addr}/search"))
        .query(&[("clientId", "foundry-A"), ("query", "stu")])
        .header("x-api-key", "not-a-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_unknown_client_is_404() {
    let (addr, _state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/search"))
        .query(&[("clientId", "nobody-here"), ("query", "stu")])
        .header("x-api-key", "K1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "CLIENT_NOT_FOUND");
}

#[tokio::test]
async fn test_hello_with_empty_client_id_is_rejected() {
    let (addr, state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let mut ws = MockTableClient::connect(&format!("ws://{addr}/relay"))
        .await
        .unwrap();

    let mut hello = Envelope::new("hello");
    hello.insert("clientId", json!(""));
    hello.insert("apiKey", json!("K1"));
    ws.send_envelope(&hello).await.unwrap();

    let error = ws.recv_envelope().await.unwrap();
    assert_eq!(error.message_type, "error");
    assert!(error
        .get_str("message")
        .unwrap_or_default()
        .contains("clientId"));
    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn test_first_frame_must_be_hello() {
    let (addr, state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let mut ws = MockTableClient::connect(&format!("ws://{addr}/relay"))
        .await
        .unwrap();

    ws.send_envelope(&Envelope::new("perform-search"))
        .await
        .unwrap();
    let error = ws.recv_envelope().await.unwrap();
    assert_eq!(error.message_type, "error");
    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn test_health_reports_replica_identity_and_directory() {
    let (addr, _state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["replicaId"], "local");
    assert_eq!(body["directoryMode"], "disabled");
    assert_eq!(body["directoryHealthy"], true);
}

#[tokio::test]
async fn test_clients_lists_only_the_callers_clients() {
    let (addr, _state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let _ws_a = MockTableClient::join(&format!("ws://{addr}/relay"), "foundry-A", "K1")
        .await
        .unwrap();
    let _ws_b = MockTableClient::join(&format!("ws://{addr}/relay"), "foundry-B", "K2")
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/clients"))
        .header("x-api-key", "K1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let clients = body["clients"].as_array().expect("clients array");
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0]["clientId"], "foundry-A");
    assert_eq!(clients[0]["local"], true);
}

#[tokio::test]
async fn test_outbound_envelopes_preserve_send_order() {
    let (addr, state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let mut ws = MockTableClient::join(&format!("ws://{addr}/relay"), "foundry-A", "K1")
        .await
        .unwrap();

    for seq in 0..5 {
        let mut envelope = Envelope::new("ordered-event");
        envelope.insert("seq", json!(seq));
        assert_eq!(
            state.registry.send("foundry-A", envelope).await,
            relay::registry::SendOutcome::Ok
        );
    }

    for expected in 0..5 {
        let envelope = ws.recv_until("ordered-event").await.unwrap();
        assert_eq!(envelope.payload["seq"], json!(expected));
    }
}

#[tokio::test]
async fn test_untokened_events_reach_subscribers() {
    let (addr, state) = start_replica(local_config(), Arc::new(MemoryDirectory::new())).await;
    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    state
        .registry
        .subscribe("roll-event", move |client_id, _envelope| {
            sink.lock().unwrap().push(client_id.to_owned());
        })
        .await;

    let mut ws = MockTableClient::join(&format!("ws://{addr}/relay"), "foundry-A", "K1")
        .await
        .unwrap();
    let mut event = Envelope::new("roll-event");
    event.insert("total", json!(17));
    ws.send_envelope(&event).await.unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriber never saw the event"
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(seen.lock().unwrap()[0], "foundry-A");
}
