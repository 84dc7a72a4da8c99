//! Home Assistant REST executor.
//!
//! Talks to a Home Assistant instance's `/api/` surface over HTTPS: reading
//! entity state, calling a service, and firing an event. Bearer-token
//! authenticated, one `reqwest::Client` reused for the process lifetime.

use crate::executor::ServiceHandler;
use crate::gateway::protocol::{ArgValue, GatewayError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;

pub struct HomeAssistantService {
    client: Client,
    base_url: String,
    token: String,
}

impl HomeAssistantService {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check_response(&self, response: reqwest::Response) -> Result<serde_json::Value, GatewayError> {
        let status = response.status();
        if status.is_success() {
            response
                .json::<serde_json::Value>()
                .await
                .or_else(|_| Ok(serde_json::Value::Null))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(GatewayError::ExecutionFailed(
                "Home Assistant rejected the configured token".to_string(),
            ))
        } else if status == StatusCode::NOT_FOUND {
            Err(GatewayError::ExecutionFailed(
                "Home Assistant entity or service not found".to_string(),
            ))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::ExecutionFailed(format!(
                "Home Assistant returned {status}: {body}"
            )))
        }
    }

    fn string_arg<'a>(&self, args: &'a BTreeMap<String, ArgValue>, key: &str) -> Option<&'a str> {
        match args.get(key) {
            Some(ArgValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[async_trait]
impl ServiceHandler for HomeAssistantService {
    async fn execute(
        &self,
        tool: &str,
        args: &BTreeMap<String, ArgValue>,
    ) -> Result<serde_json::Value, GatewayError> {
        match tool {
            "ha_get_state" => {
                let entity_id = self.string_arg(args, "entity_id").ok_or_else(|| {
                    GatewayError::ExecutionFailed("entity_id is required".to_string())
                })?;
                let response = self
                    .client
                    .get(self.url(&format!("/api/states/{entity_id}")))
                    .bearer_auth(&self.token)
                    .send()
                    .await
                    .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;
                self.check_response(response).await
            }
            "ha_get_states" => {
                let response = self
                    .client
                    .get(self.url("/api/states"))
                    .bearer_auth(&self.token)
                    .send()
                    .await
                    .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;
                self.check_response(response).await
            }
            "ha_call_service" => {
                let domain = self.string_arg(args, "domain").ok_or_else(|| {
                    GatewayError::ExecutionFailed("domain is required".to_string())
                })?;
                let service_name = self.string_arg(args, "service").ok_or_else(|| {
                    GatewayError::ExecutionFailed("service is required".to_string())
                })?;
                let mut body = serde_json::Map::new();
                if let Some(entity_id) = self.string_arg(args, "entity_id") {
                    if !entity_id.is_empty() {
                        body.insert("entity_id".to_string(), serde_json::json!(entity_id));
                    }
                }
                let response = self
                    .client
                    .post(self.url(&format!("/api/services/{domain}/{service_name}")))
                    .bearer_auth(&self.token)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;
                self.check_response(response).await
            }
            "ha_fire_event" => {
                let event_type = self.string_arg(args, "event_type").ok_or_else(|| {
                    GatewayError::ExecutionFailed("event_type is required".to_string())
                })?;
                let response = self
                    .client
                    .post(self.url(&format!("/api/events/{event_type}")))
                    .bearer_auth(&self.token)
                    .json(&serde_json::json!({}))
                    .send()
                    .await
                    .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;
                self.check_response(response).await
            }
            other => Err(GatewayError::ExecutionFailed(format!(
                "Unknown tool: {other}"
            ))),
        }
    }

    async fn health_check(&self) -> bool {
        let result = self
            .client
            .get(self.url("/api/"))
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        matches!(result, Ok(response) if response.status().is_success())
    }

    async fn close(&self) {}
}
