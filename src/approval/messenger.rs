//! The messenger adapter interface.
//!
//! A messenger is the pluggable transport for reaching a human: it knows
//! how to present an [`ApprovalRequest`] and, some time later, how to call
//! back into the gateway with the human's choice. This crate wires one
//! concrete adapter ([`crate::approval::telegram::TelegramMessenger`]); the
//! trait exists so another transport can be dropped in without touching
//! the coordinator.

use crate::approval::coordinator::ApprovalCoordinator;
use crate::approval::types::{ApprovalChoice, ApprovalResult, ApprovalRequest};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Invoked by a messenger implementation when a human resolves (or the
/// messenger itself gives up on) a pending request. Declared as an
/// extension point for a messenger that can't hold a coordinator reference
/// directly (e.g. one running out-of-process); the bundled Telegram adapter
/// doesn't need it, since its callback handler already has a coordinator
/// handle and resolves through it directly. Idempotent to call more than
/// once for the same `request_id` — only the first call has any effect.
pub type ResolveCallback = std::sync::Arc<dyn Fn(Uuid, ApprovalResult) + Send + Sync>;

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Present the request to a human. Returns an opaque handle (e.g. a
    /// message id) the messenger can use later to edit the message in
    /// place once resolved; `None` if the transport has no such concept.
    async fn send_request(&self, request: &ApprovalRequest) -> Result<Option<String>>;

    /// Best-effort: update a previously sent message to reflect the
    /// resolution. Implementations should swallow transport errors — a
    /// failure here must never fail the approval itself.
    async fn mark_resolved(&self, message_handle: &str, result: &ApprovalResult);

    /// Start whatever background listener the transport needs to receive
    /// human decisions (e.g. a bot's update dispatcher), wiring it to
    /// resolve requests through `coordinator`. Called once at gateway
    /// startup, before the server starts accepting connections.
    async fn start(&self, coordinator: Arc<ApprovalCoordinator>) -> Result<()>;

    /// Stop the background listener started by `start`. Called once on
    /// gateway shutdown.
    async fn stop(&self) -> Result<()>;
}

/// Test double: resolves every request immediately as approved, by
/// `user_id: "test-auto-approve"`. Needs the coordinator handle `start`
/// hands it to actually call back in, the same way the Telegram adapter's
/// callback handler does.
#[derive(Default)]
pub struct AutoApprove {
    coordinator: Mutex<Option<Arc<ApprovalCoordinator>>>,
}

#[async_trait]
impl Messenger for AutoApprove {
    async fn send_request(&self, request: &ApprovalRequest) -> Result<Option<String>> {
        let coordinator = self.coordinator.lock().await.clone();
        let request_id = request.request_id;
        if let Some(coordinator) = coordinator {
            tokio::spawn(async move {
                coordinator
                    .resolve_choice(
                        request_id,
                        ApprovalChoice::Approve,
                        Some("test-auto-approve".to_string()),
                    )
                    .await;
            });
        }
        Ok(None)
    }
    async fn mark_resolved(&self, _message_handle: &str, _result: &ApprovalResult) {}
    async fn start(&self, coordinator: Arc<ApprovalCoordinator>) -> Result<()> {
        *self.coordinator.lock().await = Some(coordinator);
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Test double: never resolves — useful for exercising the timeout path.
pub struct NeverResolve;

#[async_trait]
impl Messenger for NeverResolve {
    async fn send_request(&self, _request: &ApprovalRequest) -> Result<Option<String>> {
        Ok(None)
    }
    async fn mark_resolved(&self, _message_handle: &str, _result: &ApprovalResult) {}
    async fn start(&self, _coordinator: Arc<ApprovalCoordinator>) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}
