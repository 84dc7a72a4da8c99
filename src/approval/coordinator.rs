//! Approval coordinator: registers a pending request, arms its timeout,
//! and resolves exactly once — whichever of "human responds" or "timer
//! fires" happens first.

use crate::approval::messenger::Messenger;
use crate::approval::types::{ApprovalChoice, ApprovalResult, ApprovalRequest};
use crate::gateway::protocol::GatewayError;
use crate::store::{PendingRow, Store};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

struct Inflight {
    sender: oneshot::Sender<ApprovalResult>,
    message_handle: Option<String>,
}

pub struct ApprovalCoordinator {
    store: Arc<Store>,
    timeout: Duration,
    max_pending: usize,
    inflight: Mutex<HashMap<Uuid, Inflight>>,
}

impl ApprovalCoordinator {
    pub fn new(store: Arc<Store>, timeout: Duration, max_pending: usize) -> Self {
        Self {
            store,
            timeout,
            max_pending,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new pending request, notify the messenger, and wait for
    /// resolution or timeout — whichever comes first.
    pub async fn request_approval(
        &self,
        agent_id: &str,
        tool: &str,
        args: serde_json::Value,
        signature: &str,
        prompt: Option<String>,
        messenger: &dyn Messenger,
    ) -> Result<ApprovalResult, GatewayError> {
        {
            let guard = self.inflight.lock().await;
            if guard.len() >= self.max_pending {
                return Err(GatewayError::RateLimited);
            }
        }

        let request_id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let expires_at = now + chrono::Duration::from_std(self.timeout).unwrap_or_default();

        self.store
            .insert_pending(&PendingRow {
                request_id,
                agent_id: agent_id.to_string(),
                tool: tool.to_string(),
                args,
                signature: signature.to_string(),
                created_at: now,
                expires_at,
                message_handle: None,
            })
            .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();

        let request = ApprovalRequest {
            request_id,
            agent_id: agent_id.to_string(),
            tool: tool.to_string(),
            signature: signature.to_string(),
            prompt,
        };

        let message_handle = messenger
            .send_request(&request)
            .await
            .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;

        self.inflight.lock().await.insert(
            request_id,
            Inflight {
                sender: tx,
                message_handle: message_handle.clone(),
            },
        );

        let result = tokio::select! {
            resolved = rx => resolved.unwrap_or(ApprovalResult::TimedOut),
            _ = tokio::time::sleep(self.timeout) => {
                self.resolve(request_id, ApprovalResult::TimedOut).await;
                ApprovalResult::TimedOut
            }
        };

        if let Some(handle) = message_handle {
            messenger.mark_resolved(&handle, &result).await;
        }

        let _ = self.store.delete_pending(request_id);

        Ok(result)
    }

    /// Resolve a pending request. Idempotent — only the first caller for a
    /// given `request_id` has any effect; later calls are silently
    /// ignored, since the map entry is removed before the send.
    pub async fn resolve(&self, request_id: Uuid, result: ApprovalResult) -> bool {
        let removed = self.inflight.lock().await.remove(&request_id);
        match removed {
            Some(inflight) => {
                let _ = inflight.sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve a request by the choice a human made, looked up by id.
    pub async fn resolve_choice(
        &self,
        request_id: Uuid,
        choice: ApprovalChoice,
        approved_by: Option<String>,
    ) -> bool {
        self.resolve(request_id, ApprovalResult::Resolved { choice, approved_by })
            .await
    }

    /// Resolve every pending request as denied with resolver id `"shutdown"`,
    /// draining the registry. Called once, from the gateway's shutdown path.
    pub async fn resolve_all_pending(&self) {
        let mut guard = self.inflight.lock().await;
        for (_, inflight) in guard.drain() {
            let _ = inflight.sender.send(ApprovalResult::Shutdown);
        }
    }

    pub async fn message_handle_for(&self, request_id: Uuid) -> Option<String> {
        self.inflight
            .lock()
            .await
            .get(&request_id)
            .and_then(|i| i.message_handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::messenger::{AutoApprove, NeverResolve};

    #[tokio::test]
    async fn resolves_once_messenger_approves_immediately() {
        let store = Arc::new(Store::in_memory().unwrap());
        let coordinator = Arc::new(ApprovalCoordinator::new(store, Duration::from_secs(5), 10));
        let messenger = AutoApprove::default();
        messenger.start(coordinator.clone()).await.unwrap();

        let result = coordinator
            .request_approval(
                "default",
                "ha_call_service",
                serde_json::json!({}),
                "ha_call_service(lock.unlock, )",
                None,
                &messenger,
            )
            .await
            .unwrap();

        match result {
            ApprovalResult::Resolved { choice, approved_by } => {
                assert_eq!(choice, ApprovalChoice::Approve);
                assert_eq!(approved_by.as_deref(), Some("test-auto-approve"));
            }
            ApprovalResult::TimedOut => panic!("expected resolution, got timeout"),
            ApprovalResult::Shutdown => panic!("expected resolution, got shutdown"),
        }
    }

    #[tokio::test]
    async fn times_out_when_nobody_resolves() {
        let store = Arc::new(Store::in_memory().unwrap());
        let coordinator = ApprovalCoordinator::new(store, Duration::from_millis(20), 10);
        let messenger = NeverResolve;

        let result = coordinator
            .request_approval(
                "default",
                "ha_call_service",
                serde_json::json!({}),
                "ha_call_service(lock.unlock, )",
                None,
                &messenger,
            )
            .await
            .unwrap();

        assert!(matches!(result, ApprovalResult::TimedOut));
    }

    #[tokio::test]
    async fn second_resolve_is_a_no_op() {
        let store = Arc::new(Store::in_memory().unwrap());
        let coordinator = Arc::new(ApprovalCoordinator::new(store, Duration::from_secs(5), 10));
        let messenger = NeverResolve;
        let coordinator2 = coordinator.clone();

        let handle = tokio::spawn(async move {
            coordinator2
                .request_approval(
                    "default",
                    "ha_call_service",
                    serde_json::json!({}),
                    "ha_call_service(lock.unlock, )",
                    None,
                    &messenger,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = *coordinator.inflight.lock().await.keys().next().unwrap();
        let first = coordinator
            .resolve_choice(id, ApprovalChoice::Approve, None)
            .await;
        let second = coordinator
            .resolve_choice(id, ApprovalChoice::Deny, None)
            .await;

        assert!(first);
        assert!(!second);
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            ApprovalResult::Resolved {
                choice: ApprovalChoice::Approve,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rejects_new_requests_once_max_pending_reached() {
        let store = Arc::new(Store::in_memory().unwrap());
        let coordinator = Arc::new(ApprovalCoordinator::new(store, Duration::from_secs(5), 1));
        let messenger = NeverResolve;

        let coordinator2 = coordinator.clone();
        tokio::spawn(async move {
            let _ = coordinator2
                .request_approval(
                    "default",
                    "a",
                    serde_json::json!({}),
                    "a()",
                    None,
                    &messenger,
                )
                .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let messenger2 = NeverResolve;
        let result = coordinator
            .request_approval(
                "default",
                "b",
                serde_json::json!({}),
                "b()",
                None,
                &messenger2,
            )
            .await;
        assert!(result.is_err());
    }
}
