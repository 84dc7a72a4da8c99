//! End-to-end tests: a real server bound to an ephemeral port, a real
//! client, and a temp sqlite file — exercising the allow/deny/ask branches
//! of the per-request flow over the actual wire protocol.

use async_trait::async_trait;
use keepgate::approval::messenger::{AutoApprove, NeverResolve};
use keepgate::approval::{ApprovalCoordinator, Messenger};
use keepgate::client::{Client, ClientConfig, ClientError};
use keepgate::executor::{Dispatcher, ServiceHandler};
use keepgate::gateway::protocol::{ArgValue, GatewayError};
use keepgate::gateway::GatewayServer;
use keepgate::policy::parser::parse_policy;
use keepgate::policy::PolicyEngine;
use keepgate::store::Store;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const PERMISSIONS: &str = r#"
rules:
  - pattern: "ha_get_state(temp_sensor)"
    action: allow
  - pattern: "ha_call_service(lock.*, *)"
    action: deny
    description: "locks require the physical keypad"
defaults:
  - pattern: "*"
    action: ask
"#;

struct FakeHomeAssistant;

#[async_trait]
impl ServiceHandler for FakeHomeAssistant {
    async fn execute(
        &self,
        tool: &str,
        _args: &BTreeMap<String, ArgValue>,
    ) -> Result<serde_json::Value, GatewayError> {
        match tool {
            "ha_get_state" => Ok(serde_json::json!({"state": "21.5"})),
            other => Err(GatewayError::ExecutionFailed(format!("unhandled: {other}"))),
        }
    }
    async fn health_check(&self) -> bool {
        true
    }
    async fn close(&self) {}
}

async fn start_server(
    approval_timeout: Duration,
    messenger: Arc<dyn Messenger>,
) -> (std::net::SocketAddr, String) {
    start_server_with_max_pending(approval_timeout, messenger, 50).await
}

async fn start_server_with_max_pending(
    approval_timeout: Duration,
    messenger: Arc<dyn Messenger>,
    max_pending_approvals: usize,
) -> (std::net::SocketAddr, String) {
    let policy = parse_policy(PERMISSIONS).unwrap();
    let engine = PolicyEngine::new(&policy).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("keepgate.db")).unwrap());
    std::mem::forget(dir); // keep the tempdir alive for the server's lifetime

    let coordinator = Arc::new(ApprovalCoordinator::new(
        store.clone(),
        approval_timeout,
        max_pending_approvals,
    ));
    messenger.start(coordinator.clone()).await.unwrap();

    let mut services: HashMap<String, Arc<dyn ServiceHandler>> = HashMap::new();
    services.insert("homeassistant".to_string(), Arc::new(FakeHomeAssistant));
    let dispatcher = Dispatcher::new(services);

    let token = "test-token".to_string();
    let server = GatewayServer::new(
        "127.0.0.1:0".parse().unwrap(),
        None,
        engine,
        store,
        coordinator,
        dispatcher,
        messenger,
        token.clone(),
        1000,
        Duration::from_secs(60),
    );

    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    // Give the accept loop a moment to start polling.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, token)
}

async fn connect(addr: std::net::SocketAddr, token: &str) -> Client {
    Client::connect(ClientConfig {
        url: format!("ws://{addr}"),
        token: token.to_string(),
        agent_id: "default".to_string(),
        max_retries: Some(0),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn allowed_request_executes_and_returns_result() {
    let (addr, token) =
        start_server(Duration::from_secs(5), Arc::new(NeverResolve)).await;
    let client = connect(addr, &token).await;

    let mut args = BTreeMap::new();
    args.insert("entity_id".to_string(), serde_json::json!("temp_sensor"));
    let result = client
        .tool_request("ha_get_state", serde_json::json!({"entity_id": "temp_sensor"}))
        .await
        .unwrap();

    assert_eq!(result["status"], "executed");
    assert_eq!(result["data"]["state"], "21.5");
}

#[tokio::test]
async fn denied_request_returns_policy_denied_error() {
    let (addr, token) =
        start_server(Duration::from_secs(5), Arc::new(NeverResolve)).await;
    let client = connect(addr, &token).await;

    let result = client
        .tool_request(
            "ha_call_service",
            serde_json::json!({"domain": "lock", "service": "unlock", "entity_id": "lock.front_door"}),
        )
        .await;

    assert!(matches!(result, Err(ClientError::PolicyDenied(_))));
}

#[tokio::test]
async fn unmatched_request_times_out_waiting_for_approval() {
    let (addr, token) =
        start_server(Duration::from_millis(100), Arc::new(NeverResolve)).await;
    let client = connect(addr, &token).await;

    let result = client
        .tool_request("ha_turn_on_everything", serde_json::json!({}))
        .await;

    assert!(matches!(result, Err(ClientError::ApprovalTimeout)));
}

/// Scenario C from the specification: a request falls through to `ask`,
/// the messenger resolves it as approved, and the client sees the same
/// successful result it would have gotten on the fast allow path.
#[tokio::test]
async fn unmatched_request_executes_once_messenger_approves() {
    let (addr, token) = start_server(
        Duration::from_secs(5),
        Arc::new(AutoApprove::default()),
    )
    .await;
    let client = connect(addr, &token).await;

    let result = client
        .tool_request("ha_get_state", serde_json::json!({"entity_id": "other_sensor"}))
        .await
        .unwrap();

    assert_eq!(result["status"], "executed");
    assert_eq!(result["data"]["state"], "21.5");
}

#[tokio::test]
async fn wrong_token_fails_authentication() {
    let (addr, _token) =
        start_server(Duration::from_secs(5), Arc::new(NeverResolve)).await;
    let result = Client::connect(ClientConfig {
        url: format!("ws://{addr}"),
        token: "wrong-token".to_string(),
        agent_id: "default".to_string(),
        max_retries: Some(0),
    })
    .await;

    assert!(result.is_err());
}

/// Scenario E from the specification: a request's approval resolves after
/// the connection that sent it is already gone. The audit row is the
/// source of truth, and a fresh connection for the same agent recovers it
/// through `get_pending_results` in the exact `{status, data}` envelope a
/// live response would have carried.
#[tokio::test]
async fn reconnect_replay_delivers_result_recorded_while_disconnected() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (addr, token) =
        start_server(Duration::from_secs(5), Arc::new(AutoApprove::default())).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws.send(Message::Text(
        serde_json::json!({
            "id": "auth-1",
            "method": "auth",
            "params": {"token": token, "agent_id": "default"},
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    let _ = ws.next().await.unwrap().unwrap();
    ws.send(Message::Text(
        serde_json::json!({
            "id": 1,
            "method": "tool_request",
            "params": {"tool": "ha_get_state", "args": {"entity_id": "other_sensor"}},
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    // Drop the connection before the approval resolves and the response
    // can be sent back.
    drop(ws);

    // Give the auto-approving messenger time to resolve and the server
    // time to write the audit resolution.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A second, independent connection for the same agent, rather than
    // `keepgate::client::Client`: the SDK client drains any already-resolved
    // rows as part of its own connect-time replay, which would otherwise
    // race this test's explicit `get_pending_results` call.
    let (mut ws2, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws2.send(Message::Text(
        serde_json::json!({
            "id": "auth-1",
            "method": "auth",
            "params": {"token": token, "agent_id": "default"},
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    let _ = ws2.next().await.unwrap().unwrap();
    ws2.send(Message::Text(
        serde_json::json!({"id": 2, "method": "get_pending_results", "params": {}})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let Message::Text(raw) = ws2.next().await.unwrap().unwrap() else {
        panic!("expected a text frame");
    };
    let response: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let results = response["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["request_id"], 1);

    let result: serde_json::Value =
        serde_json::from_str(results[0]["result"].as_str().unwrap()).unwrap();
    assert_eq!(result["status"], "executed");
    assert_eq!(result["data"]["state"], "21.5");
}

/// Scenario F from the specification: once `max_pending_approvals` pending
/// requests are outstanding, the next `ask`-triggering request is rejected
/// with `-32006` rather than queued, while the ones already pending are
/// unaffected by the rejection.
#[tokio::test]
async fn third_concurrent_approval_is_rate_limited() {
    let (addr, token) =
        start_server_with_max_pending(Duration::from_millis(200), Arc::new(NeverResolve), 2).await;
    let client = Arc::new(connect(addr, &token).await);

    let mut background = Vec::new();
    for n in 0..2 {
        let client = client.clone();
        background.push(tokio::spawn(async move {
            client
                .tool_request("ha_turn_on_everything", serde_json::json!({"n": n}))
                .await
        }));
    }

    // Give the first two a moment to register as pending approvals before
    // the third one arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let third = client
        .tool_request("ha_turn_on_everything", serde_json::json!({"n": 2}))
        .await;
    assert!(matches!(third, Err(ClientError::RateLimited)));

    for handle in background {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ClientError::ApprovalTimeout)));
    }
}
