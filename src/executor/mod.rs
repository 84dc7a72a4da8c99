//! Executor dispatcher: routes an allowed tool call to the downstream
//! service configured for it.

pub mod homeassistant;

use crate::gateway::protocol::{ArgValue, GatewayError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn execute(
        &self,
        tool: &str,
        args: &BTreeMap<String, ArgValue>,
    ) -> Result<serde_json::Value, GatewayError>;

    /// Best-effort liveness check; swallows transport errors and returns
    /// `false` rather than propagating them — a dead downstream service
    /// must not crash the gateway at startup.
    async fn health_check(&self) -> bool;

    async fn close(&self);
}

/// Static tool → service routing table, built once at startup from
/// configuration.
pub struct Dispatcher {
    tool_service: HashMap<&'static str, String>,
    services: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl Dispatcher {
    pub fn new(services: HashMap<String, Arc<dyn ServiceHandler>>) -> Self {
        let tool_service = HashMap::from([
            ("ha_get_state", "homeassistant"),
            ("ha_get_states", "homeassistant"),
            ("ha_call_service", "homeassistant"),
            ("ha_fire_event", "homeassistant"),
        ])
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();

        Self {
            tool_service,
            services,
        }
    }

    pub async fn dispatch(
        &self,
        tool: &str,
        args: &BTreeMap<String, ArgValue>,
    ) -> Result<serde_json::Value, GatewayError> {
        let service_name = self
            .tool_service
            .get(tool)
            .ok_or_else(|| GatewayError::ExecutionFailed(format!("Unknown tool: {tool}")))?;
        let service = self.services.get(service_name).ok_or_else(|| {
            GatewayError::ExecutionFailed(format!("Service not configured: {service_name}"))
        })?;
        service.execute(tool, args).await
    }

    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (name, service) in &self.services {
            results.insert(name.clone(), service.health_check().await);
        }
        results
    }

    pub async fn close_all(&self) {
        for service in self.services.values() {
            service.close().await;
        }
    }
}
