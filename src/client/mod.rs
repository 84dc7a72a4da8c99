//! Reconnecting SDK client.
//!
//! Wraps a WebSocket connection to the gateway: authenticates on connect,
//! multiplexes concurrent `tool_request` calls by id, and reconnects with
//! exponential backoff on disconnect without dropping the futures callers
//! are already awaiting — they resolve later, either from a response that
//! arrives after reconnection or from a `get_pending_results` replay.

use crate::gateway::protocol::{AuthParams, RequestId, RpcRequest, RpcResponse};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("denied by user")]
    DeniedByUser,
    #[error("approval timed out")]
    ApprovalTimeout,
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("rate limited")]
    RateLimited,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("gateway is shutting down")]
    GatewayShutdown,
    /// Raised for every future still outstanding once reconnection gives up
    /// (`max_retries` exhausted) — never left to hang silently.
    #[error("Connection lost")]
    ConnectionLost,
    #[error("gateway error {code}: {message}")]
    Other { code: i32, message: String },
}

impl From<crate::gateway::protocol::RpcError> for ClientError {
    fn from(e: crate::gateway::protocol::RpcError) -> Self {
        match e.code {
            -32001 => ClientError::DeniedByUser,
            -32002 => ClientError::ApprovalTimeout,
            -32003 => ClientError::PolicyDenied(e.message),
            -32004 => ClientError::ExecutionFailed(e.message),
            -32005 => ClientError::AuthFailed,
            -32006 => ClientError::RateLimited,
            -32000 => ClientError::GatewayShutdown,
            code => ClientError::Other {
                code,
                message: e.message,
            },
        }
    }
}

pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

fn default_sleep_fn() -> SleepFn {
    Arc::new(|d| Box::pin(tokio::time::sleep(d)))
}

#[derive(Clone)]
pub struct ClientConfig {
    pub url: String,
    pub token: String,
    pub agent_id: String,
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<serde_json::Value, ClientError>>>>>;

struct Shared {
    config: ClientConfig,
    sleep_fn: SleepFn,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: AtomicBool,
    outbox: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Message>>>,
}

/// The reconnecting client.
pub struct Client {
    shared: Arc<Shared>,
    driver: tokio::task::JoinHandle<()>,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with_sleep_fn(config, default_sleep_fn()).await
    }

    pub async fn connect_with_sleep_fn(
        config: ClientConfig,
        sleep_fn: SleepFn,
    ) -> Result<Self, ClientError> {
        let shared = Arc::new(Shared {
            config,
            sleep_fn,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            outbox: Mutex::new(None),
        });

        // Establish the first connection synchronously so `connect` fails
        // fast if the gateway is unreachable or the token is wrong.
        connect_once(&shared).await?;

        let driver_shared = shared.clone();
        let driver = tokio::spawn(async move { drive(driver_shared).await });

        Ok(Self { shared, driver })
    }

    pub async fn tool_request(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let id = RequestId::Num(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        let request = RpcRequest {
            id,
            method: "tool_request".to_string(),
            params: serde_json::json!({"tool": tool, "args": args}),
        };
        self.send(request).await?;

        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    pub async fn get_pending_results(&self) -> Result<serde_json::Value, ClientError> {
        let id = RequestId::Num(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        let request = RpcRequest {
            id,
            method: "get_pending_results".to_string(),
            params: serde_json::Value::Null,
        };
        self.send(request).await?;

        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    async fn send(&self, request: RpcRequest) -> Result<(), ClientError> {
        let text = serde_json::to_string(&request).map_err(|e| ClientError::Other {
            code: 0,
            message: e.to_string(),
        })?;
        let guard = self.shared.outbox.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text.into()))
                .map_err(|_| ClientError::ConnectionClosed),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Stop all reconnection attempts and close the underlying socket.
    pub async fn close(self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        *self.shared.outbox.lock().await = None;
        self.driver.abort();
    }
}

/// Establishes one connection, authenticates, wires the outbox, and spawns
/// the reader loop. Returns once authenticated.
async fn connect_once(shared: &Arc<Shared>) -> Result<(), ClientError> {
    let (ws, _) = tokio_tungstenite::connect_async(&shared.config.url)
        .await
        .map_err(|e| ClientError::Other {
            code: 0,
            message: e.to_string(),
        })?;
    let (mut sink, mut source) = ws.split();

    let auth_request = RpcRequest {
        id: RequestId::Str("auth-1".to_string()),
        method: "auth".to_string(),
        params: serde_json::to_value(AuthParams {
            token: shared.config.token.clone(),
            agent_id: shared.config.agent_id.clone(),
        })
        .unwrap(),
    };
    let text = serde_json::to_string(&auth_request).unwrap();
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| ClientError::Other {
            code: 0,
            message: e.to_string(),
        })?;

    match source.next().await {
        Some(Ok(Message::Text(text))) => {
            let response: RpcResponse = serde_json::from_str(&text).map_err(|e| ClientError::Other {
                code: 0,
                message: e.to_string(),
            })?;
            if let Some(error) = response.error {
                return Err(error.into());
            }
            let status = response
                .result
                .as_ref()
                .and_then(|r| r.get("status"))
                .and_then(|s| s.as_str());
            if status != Some("authenticated") {
                return Err(ClientError::AuthFailed);
            }
        }
        _ => return Err(ClientError::AuthFailed),
    }

    let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    *shared.outbox.lock().await = Some(outbox_tx);

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let reader_shared = shared.clone();
    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<RpcResponse>(&text) {
                    Ok(response) => resolve(&reader_shared, response).await,
                    Err(e) => tracing::warn!(error = %e, "ignoring malformed frame from gateway"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        writer_task.abort();
        *reader_shared.outbox.lock().await = None;
    });

    // Replay any results that resolved while we were disconnected.
    let _ = replay_pending_results(shared).await;

    Ok(())
}

async fn resolve(shared: &Arc<Shared>, response: RpcResponse) {
    let sender = shared.pending.lock().await.remove(&response.id);
    if let Some(sender) = sender {
        let result = match response.error {
            Some(e) => Err(e.into()),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };
        let _ = sender.send(result);
    }
}

async fn replay_pending_results(shared: &Arc<Shared>) -> Result<(), ClientError> {
    let id = RequestId::Num(shared.next_id.fetch_add(1, Ordering::SeqCst));
    let (tx, rx) = oneshot::channel();
    shared.pending.lock().await.insert(id.clone(), tx);

    let request = RpcRequest {
        id,
        method: "get_pending_results".to_string(),
        params: serde_json::Value::Null,
    };
    let text = serde_json::to_string(&request).unwrap();
    if let Some(outbox) = shared.outbox.lock().await.as_ref() {
        let _ = outbox.send(Message::Text(text.into()));
    }

    let value = rx.await.map_err(|_| ClientError::ConnectionClosed)??;
    if let Some(results) = value.get("results").and_then(|r| r.as_array()) {
        for entry in results {
            let matching_id = entry.get("request_id").and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.parse::<u64>().ok()))
            });
            let Some(matching_id) = matching_id else {
                continue;
            };
            let sender = shared
                .pending
                .lock()
                .await
                .remove(&RequestId::Num(matching_id));
            if let Some(sender) = sender {
                // `result` on the wire is the same stringified `{status,
                // data}` envelope a live response's `result` field carries —
                // parse it back so a replayed future resolves with exactly
                // what it would have if the connection had stayed up.
                let result = entry
                    .get("result")
                    .and_then(|v| v.as_str())
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
                    .unwrap_or(serde_json::Value::Null);
                let _ = sender.send(Ok(result));
            }
        }
    }
    Ok(())
}

/// Supervises the connection: whenever the reader loop in `connect_once`
/// exits (the outbox becomes `None`), reconnects with exponential backoff
/// — 1s, 2s, 4s, ... capped at 30s — until it succeeds, `max_retries` is
/// exhausted, or the client has been closed.
async fn drive(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if shared.outbox.lock().await.is_some() {
            continue;
        }

        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_secs(1);
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(max) = shared.config.max_retries {
                if attempt >= max {
                    fail_all_pending(&shared, ClientError::ConnectionLost).await;
                    return;
                }
            }
            match connect_once(&shared).await {
                Ok(()) => break,
                Err(_) => {
                    attempt += 1;
                    (shared.sleep_fn)(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
                }
            }
        }
    }
}

/// Resolves every still-outstanding request future with `err` rather than
/// leaving its caller awaiting forever — used once reconnection gives up.
async fn fail_all_pending(shared: &Arc<Shared>, err: ClientError) {
    let mut pending = shared.pending.lock().await;
    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(err.clone()));
    }
}
