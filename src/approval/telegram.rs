//! Telegram messenger adapter.
//!
//! Presents each approval request as a message with an inline "Approve" /
//! "Deny" keyboard. Callback data carries the request id and choice, so the
//! bot doesn't need any session state to know what a button press is
//! answering. Button presses from anyone not in `allowed_users` are
//! ignored — optionally audited, never denied, since an unauthorized press
//! should not affect the outcome at all.

use crate::approval::coordinator::ApprovalCoordinator;
use crate::approval::messenger::Messenger;
use crate::approval::types::{ApprovalChoice, ApprovalResult, ApprovalRequest, CallbackData};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tokio::sync::Mutex;
use tracing::warn;

pub struct TelegramMessenger {
    bot: Bot,
    /// Where approval requests are sent. Distinct from `allowed_users`: a
    /// group chat can receive the request while only specific members are
    /// trusted to press its buttons.
    chat_id: i64,
    allowed_users: Vec<i64>,
    audit_ignored_presses: bool,
    store: Arc<crate::store::Store>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TelegramMessenger {
    pub fn new(
        token: &str,
        chat_id: i64,
        allowed_users: Vec<i64>,
        audit_ignored_presses: bool,
        store: Arc<crate::store::Store>,
    ) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id,
            allowed_users,
            audit_ignored_presses,
            store,
            dispatcher: Mutex::new(None),
        }
    }

    /// Spawns the dispatcher that listens for callback-query updates and
    /// routes resolved button presses to the coordinator. Driven manually
    /// (no `run_polling`-style blocking loop) so the caller can race it
    /// against the gateway's own accept loop and shutdown signal.
    fn spawn_dispatcher(&self, coordinator: Arc<ApprovalCoordinator>) -> tokio::task::JoinHandle<()> {
        let bot = self.bot.clone();
        let allowed_users = self.allowed_users.clone();
        let audit_ignored_presses = self.audit_ignored_presses;
        let store = self.store.clone();

        tokio::spawn(async move {
            let handler = Update::filter_callback_query().endpoint(
                move |bot: Bot, query: CallbackQuery| {
                    let coordinator = coordinator.clone();
                    let allowed_users = allowed_users.clone();
                    let store = store.clone();
                    async move {
                        handle_callback(
                            bot,
                            query,
                            coordinator,
                            allowed_users,
                            audit_ignored_presses,
                            store,
                        )
                        .await;
                        respond(())
                    }
                },
            );

            Dispatcher::builder(bot, dptree::entry().branch(handler))
                .build()
                .dispatch()
                .await;
        })
    }
}

async fn handle_callback(
    bot: Bot,
    query: CallbackQuery,
    coordinator: Arc<ApprovalCoordinator>,
    allowed_users: Vec<i64>,
    audit_ignored_presses: bool,
    store: Arc<crate::store::Store>,
) {
    let Some(data) = query.data.as_deref() else {
        return;
    };
    let Ok(callback) = serde_json::from_str::<CallbackData>(data) else {
        warn!("ignoring malformed telegram callback data");
        return;
    };

    let user_id = query.from.id.0 as i64;
    if !allowed_users.contains(&user_id) {
        if audit_ignored_presses {
            let _ = store.append_audit(&crate::store::AuditEntry {
                agent_id: "default".to_string(),
                tool: "approval_button".to_string(),
                args: serde_json::json!({"telegram_user_id": user_id}),
                signature: format!("approval_button({})", callback.request_id),
                decision: "ignored".to_string(),
                resolution: Some("unauthorized_approver".to_string()),
                execution_result: None,
                client_request_id: None,
            });
        }
        let _ = bot.answer_callback_query(query.id).await;
        return;
    }

    let approved_by = query
        .from
        .username
        .clone()
        .unwrap_or_else(|| user_id.to_string());

    coordinator
        .resolve_choice(callback.request_id, callback.choice, Some(approved_by))
        .await;

    let _ = bot.answer_callback_query(query.id).await;
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_request(&self, request: &ApprovalRequest) -> Result<Option<String>> {
        let text = format!(
            "Approval requested by {}\ntool: {}\n{}",
            request.agent_id,
            request.tool,
            request.prompt.as_deref().unwrap_or(&request.signature),
        );
        let keyboard = InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback(
                "Approve",
                serde_json::to_string(&CallbackData {
                    request_id: request.request_id,
                    choice: ApprovalChoice::Approve,
                })
                .context("encoding callback data")?,
            ),
            InlineKeyboardButton::callback(
                "Deny",
                serde_json::to_string(&CallbackData {
                    request_id: request.request_id,
                    choice: ApprovalChoice::Deny,
                })
                .context("encoding callback data")?,
            ),
        ]]);

        let handle = match self
            .bot
            .send_message(ChatId(self.chat_id), &text)
            .reply_markup(keyboard)
            .await
        {
            Ok(message) => Some(message.id.0.to_string()),
            Err(e) => {
                warn!(chat_id = self.chat_id, error = %e, "failed to send approval request");
                None
            }
        };
        Ok(handle)
    }

    async fn mark_resolved(&self, message_handle: &str, result: &ApprovalResult) {
        let (status, detail) = match result {
            ApprovalResult::Resolved {
                choice: ApprovalChoice::Approve,
                approved_by,
            } => (
                "approved",
                format!("by {}", approved_by.as_deref().unwrap_or("unknown")),
            ),
            ApprovalResult::Resolved {
                choice: ApprovalChoice::Deny,
                approved_by,
            } => (
                "denied",
                format!("by {}", approved_by.as_deref().unwrap_or("unknown")),
            ),
            ApprovalResult::TimedOut => ("timed out", "no response within the deadline".to_string()),
            ApprovalResult::Shutdown => ("gateway shutdown", "resolved during shutdown".to_string()),
        };

        let Ok(message_id) = message_handle.parse::<i32>() else {
            warn!(message_handle, "telegram message handle is not a valid message id");
            return;
        };

        let text = format!("{status}\n\n{detail}");
        if let Err(e) = self
            .bot
            .edit_message_text(ChatId(self.chat_id), teloxide::types::MessageId(message_id), text)
            .await
        {
            warn!(error = %e, "failed to edit telegram approval message");
        }
    }

    async fn start(&self, coordinator: Arc<ApprovalCoordinator>) -> Result<()> {
        let handle = self.spawn_dispatcher(coordinator);
        *self.dispatcher.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.dispatcher.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}
