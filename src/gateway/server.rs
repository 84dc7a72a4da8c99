//! Gateway server — the security boundary between agent and Home
//! Assistant.
//!
//! Accepts WebSocket connections and, per connection:
//! 1. Waits for an `auth` call and validates the bearer token.
//! 2. Once authenticated, accepts `tool_request` and `get_pending_results`
//!    calls, each served on its own task so slow approvals on one request
//!    never block another request on the same connection.
//! 3. For every `tool_request`: builds a signature, validates it, checks
//!    the connection's rate limit, evaluates policy, optionally asks a
//!    human, dispatches to the executor, and always writes an audit row —
//!    even when something along the way failed.

use crate::approval::{ApprovalChoice, ApprovalCoordinator, ApprovalResult, Messenger};
use crate::executor::Dispatcher;
use crate::gateway::protocol::{
    ArgValue, AuthParams, GatewayError, RequestId, RpcRequest, RpcResponse, ToolRequestParams,
};
use crate::gateway::session::{ConnectionState, SessionState};
use crate::policy::{Decision, PolicyEngine};
use crate::signature;
use crate::store::{AuditEntry, Store};
use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Either a bare TCP connection or one wrapped in a TLS session, so the
/// WebSocket layer above can stay generic over "some duplex byte stream"
/// regardless of whether `gateway.tls` is configured.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream>>;

pub struct GatewayServer {
    bind_addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    engine: Arc<PolicyEngine>,
    store: Arc<Store>,
    coordinator: Arc<ApprovalCoordinator>,
    dispatcher: Arc<Dispatcher>,
    messenger: Arc<dyn Messenger>,
    auth_token: String,
    rate_limit_max: u32,
    rate_limit_window: Duration,
}

impl GatewayServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
        engine: PolicyEngine,
        store: Arc<Store>,
        coordinator: Arc<ApprovalCoordinator>,
        dispatcher: Dispatcher,
        messenger: Arc<dyn Messenger>,
        auth_token: String,
        rate_limit_max: u32,
        rate_limit_window: Duration,
    ) -> Self {
        Self {
            bind_addr,
            tls_acceptor,
            engine: Arc::new(engine),
            store,
            coordinator,
            dispatcher: Arc::new(dispatcher),
            messenger,
            auth_token,
            rate_limit_max,
            rate_limit_window,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Bind without serving — lets callers (tests, mainly) discover the
    /// actual port when `bind_addr`'s port is 0 before handing the
    /// listener to [`GatewayServer::serve`].
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.bind_addr).await?)
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "gateway listening");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let engine = self.engine.clone();
            let store = self.store.clone();
            let coordinator = self.coordinator.clone();
            let dispatcher = self.dispatcher.clone();
            let messenger = self.messenger.clone();
            let auth_token = self.auth_token.clone();
            let rate_limit_max = self.rate_limit_max;
            let rate_limit_window = self.rate_limit_window;
            let tls_acceptor = self.tls_acceptor.clone();

            tokio::spawn(async move {
                let stream = match tls_acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => MaybeTlsStream::Tls(Box::new(tls)),
                        Err(e) => {
                            tracing::warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => MaybeTlsStream::Plain(stream),
                };

                if let Err(e) = handle_connection(
                    stream,
                    engine,
                    store,
                    coordinator,
                    dispatcher,
                    messenger,
                    auth_token,
                    rate_limit_max,
                    rate_limit_window,
                )
                .await
                {
                    tracing::warn!(peer = %peer_addr, error = %e, "connection ended with error");
                }
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: MaybeTlsStream,
    engine: Arc<PolicyEngine>,
    store: Arc<Store>,
    coordinator: Arc<ApprovalCoordinator>,
    dispatcher: Arc<Dispatcher>,
    messenger: Arc<dyn Messenger>,
    auth_token: String,
    rate_limit_max: u32,
    rate_limit_window: Duration,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (sink, mut source) = ws.split();
    let sink = Arc::new(Mutex::new(sink));

    let mut session = ConnectionState::new(rate_limit_max, rate_limit_window);
    session.state = SessionState::AuthWait;

    // First frame must authenticate the connection before anything else
    // is accepted.
    let agent_id = match authenticate(&mut source, &sink, &auth_token).await? {
        Some(agent_id) => agent_id,
        None => return Ok(()),
    };
    session.agent_id = Some(agent_id.clone());
    session.state = SessionState::Ready;

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        let Message::Text(text) = message else {
            if message.is_close() {
                break;
            }
            continue;
        };

        let request: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => continue,
        };

        match request.method.as_str() {
            "tool_request" => {
                if !session.rate_limiter.allow() {
                    send(&sink, RpcResponse::err(request.id, GatewayError::RateLimited.into())).await;
                    continue;
                }
                let engine = engine.clone();
                let store = store.clone();
                let coordinator = coordinator.clone();
                let dispatcher = dispatcher.clone();
                let messenger = messenger.clone();
                let sink = sink.clone();
                let agent_id = agent_id.clone();
                tokio::spawn(async move {
                    let response = handle_tool_request(
                        request.id.clone(),
                        request.params,
                        &agent_id,
                        &engine,
                        &store,
                        &coordinator,
                        &dispatcher,
                        messenger.as_ref(),
                    )
                    .await;
                    send(&sink, response).await;
                });
            }
            "get_pending_results" => {
                let store = store.clone();
                let sink = sink.clone();
                let agent_id = agent_id.clone();
                let id = request.id.clone();
                tokio::spawn(async move {
                    let response = handle_get_pending_results(id, &agent_id, &store);
                    send(&sink, response).await;
                });
            }
            other => {
                send(
                    &sink,
                    RpcResponse::err(request.id, GatewayError::MethodNotFound(other.to_string()).into()),
                )
                .await;
            }
        }
    }

    session.state = SessionState::Closing;
    let _ = sink.lock().await.close().await;
    session.state = SessionState::Closed;
    Ok(())
}

async fn authenticate(
    source: &mut WsSource,
    sink: &Arc<Mutex<WsSink>>,
    auth_token: &str,
) -> Result<Option<String>> {
    let Some(Ok(Message::Text(text))) = source.next().await else {
        return Ok(None);
    };
    let request: RpcRequest = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };

    if request.method != "auth" {
        send(
            sink,
            RpcResponse::err(request.id, GatewayError::AuthFailed.into()),
        )
        .await;
        return Ok(None);
    }

    let params: AuthParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(_) => {
            send(
                sink,
                RpcResponse::err(request.id, GatewayError::AuthFailed.into()),
            )
            .await;
            return Ok(None);
        }
    };

    if !tokens_match(&params.token, auth_token) {
        send(
            sink,
            RpcResponse::err(request.id, GatewayError::AuthFailed.into()),
        )
        .await;
        return Ok(None);
    }

    send(
        sink,
        RpcResponse::ok(request.id, serde_json::json!({"status": "authenticated"})),
    )
    .await;
    Ok(Some(params.agent_id))
}

/// Constant-time token comparison — string length differences alone are
/// not timing-sensitive here, so padding is unnecessary; the comparison
/// just never short-circuits once lengths match.
fn tokens_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len() && given.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[allow(clippy::too_many_arguments)]
async fn handle_tool_request(
    id: RequestId,
    params: serde_json::Value,
    agent_id: &str,
    engine: &PolicyEngine,
    store: &Store,
    coordinator: &ApprovalCoordinator,
    dispatcher: &Dispatcher,
    messenger: &dyn Messenger,
) -> RpcResponse {
    let params: ToolRequestParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            return RpcResponse::err(
                id,
                GatewayError::PolicyDenied(format!("invalid tool_request params: {e}")).into(),
            )
        }
    };

    if let Err(e) = signature::validate(&params.tool, &params.args) {
        let args_json = args_to_json(&params.args);
        let entry = AuditEntry {
            agent_id: agent_id.to_string(),
            tool: params.tool.clone(),
            args: args_json,
            signature: String::new(),
            decision: "deny".to_string(),
            resolution: Some("validation_failed".to_string()),
            execution_result: None,
            client_request_id: Some(id.to_string()),
        };
        if let Err(store_err) = store.append_audit(&entry) {
            tracing::error!(error = %store_err, "failed to write audit entry");
        }
        return RpcResponse::err(id, GatewayError::PolicyDenied(e.to_string()).into());
    }

    let sig = signature::build(&params.tool, &params.args);
    let args_json = args_to_json(&params.args);

    let decision = engine.evaluate(&sig);

    let decision_label = match &decision {
        Decision::Denied { .. } => "deny",
        Decision::Allowed => "allow",
        Decision::RequiresApproval { .. } => "ask",
    };

    let row_id = match store.append_audit(&AuditEntry {
        agent_id: agent_id.to_string(),
        tool: params.tool.clone(),
        args: args_json.clone(),
        signature: sig.as_str().to_string(),
        decision: decision_label.to_string(),
        resolution: None,
        execution_result: None,
        client_request_id: Some(id.to_string()),
    }) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!(error = %e, "failed to write audit entry");
            None
        }
    };

    let (resolution, resolved_by, outcome) = match &decision {
        Decision::Denied { reason } => (
            "denied_by_policy",
            None,
            Err(GatewayError::PolicyDenied(reason.clone())),
        ),
        Decision::Allowed => {
            let outcome = dispatcher.dispatch(&params.tool, &params.args).await;
            let resolution = if outcome.is_ok() {
                "executed"
            } else {
                "execution_failed"
            };
            (resolution, None, outcome)
        }
        Decision::RequiresApproval { prompt } => {
            let result = coordinator
                .request_approval(
                    agent_id,
                    &params.tool,
                    args_json.clone(),
                    sig.as_str(),
                    prompt.clone(),
                    messenger,
                )
                .await;
            match result {
                Ok(ApprovalResult::Resolved {
                    choice: ApprovalChoice::Approve,
                    approved_by,
                }) => {
                    let outcome = dispatcher.dispatch(&params.tool, &params.args).await;
                    let resolution = if outcome.is_ok() {
                        "executed"
                    } else {
                        "execution_failed"
                    };
                    (resolution, approved_by, outcome)
                }
                Ok(ApprovalResult::Resolved {
                    choice: ApprovalChoice::Deny,
                    approved_by,
                }) => ("denied_by_user", approved_by, Err(GatewayError::DeniedByUser)),
                Ok(ApprovalResult::TimedOut) => (
                    "approval_timeout",
                    None,
                    Err(GatewayError::ApprovalTimeout),
                ),
                Ok(ApprovalResult::Shutdown) => (
                    "denied_by_shutdown",
                    Some("shutdown".to_string()),
                    Err(GatewayError::GatewayShutdown),
                ),
                Err(e) => ("error", None, Err(e)),
            }
        }
    };

    // Wrap a successful outcome in the `{status, data}` envelope the wire
    // protocol and the audit log both use, so a `get_pending_results` replay
    // reconstructs exactly what a live response would have carried.
    let outcome: Result<serde_json::Value, GatewayError> =
        outcome.map(|result| serde_json::json!({"status": "executed", "data": result}));

    if let Some(id) = row_id {
        if let Err(e) = store.record_resolution(
            id,
            resolution,
            outcome.as_ref().ok(),
            resolved_by.as_deref(),
        ) {
            tracing::error!(error = %e, "failed to record audit resolution");
        }
    }

    match outcome {
        Ok(result) => RpcResponse::ok(id, result),
        Err(e) => RpcResponse::err(id, e.into()),
    }
}

/// Spec §6 shape: each entry is `{request_id, result:<stringified JSON>}`,
/// where `request_id` is the wire id the client used for the original
/// `tool_request` call (so its SDK can match the entry back to the local
/// future it's still holding) and `result` is the same stringified
/// `{status, data}` envelope a live response would have carried.
fn handle_get_pending_results(id: RequestId, agent_id: &str, store: &Store) -> RpcResponse {
    match store.take_undelivered(agent_id) {
        Ok(rows) => {
            let results: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    let request_id = match row.client_request_id.as_deref().and_then(|s| s.parse::<u64>().ok()) {
                        Some(n) => serde_json::json!(n),
                        None => serde_json::json!(row.client_request_id),
                    };
                    let result = row
                        .execution_result
                        .unwrap_or(serde_json::Value::Null)
                        .to_string();
                    serde_json::json!({
                        "request_id": request_id,
                        "tool": row.tool,
                        "decision": row.decision,
                        "resolution": row.resolution,
                        "result": result,
                    })
                })
                .collect();
            RpcResponse::ok(id, serde_json::json!({"results": results}))
        }
        Err(e) => RpcResponse::err(id, GatewayError::ExecutionFailed(e.to_string()).into()),
    }
}

fn args_to_json(args: &std::collections::BTreeMap<String, ArgValue>) -> serde_json::Value {
    serde_json::to_value(args).unwrap_or(serde_json::Value::Null)
}

async fn send(sink: &Arc<Mutex<WsSink>>, response: RpcResponse) {
    let Ok(text) = serde_json::to_string(&response) else {
        return;
    };
    let mut guard = sink.lock().await;
    let _ = guard.send(Message::Text(text.into())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_tokens_compare_equal() {
        assert!(tokens_match("correct-horse-battery", "correct-horse-battery"));
    }

    #[test]
    fn mismatched_tokens_of_equal_length_are_rejected() {
        assert!(!tokens_match("correct-horse-batteryy", "correct-horse-batteryx"));
    }

    #[test]
    fn tokens_of_different_length_are_rejected() {
        assert!(!tokens_match("short", "much-longer-token"));
    }

    /// Property: comparison outcome depends only on whether the two tokens
    /// are equal, never on *where* they first differ — `ct_eq` scans every
    /// byte regardless, so a timing adversary gains no positional signal.
    /// This can't observe timing directly in a unit test; it instead pins
    /// the only input that should affect the verdict (equality itself).
    #[test]
    fn verdict_depends_only_on_equality_not_on_divergence_point() {
        let expected = "a-fairly-long-shared-secret-token-value";
        let differs_early = "X-fairly-long-shared-secret-token-value";
        let differs_late = "a-fairly-long-shared-secret-token-valuX";
        assert!(!tokens_match(differs_early, expected));
        assert!(!tokens_match(differs_late, expected));
    }
}
