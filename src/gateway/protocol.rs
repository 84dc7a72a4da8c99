//! Wire protocol types.
//!
//! Defines the JSON-RPC 2.0-shaped messages exchanged between an SDK client
//! and the gateway over a WebSocket connection: `auth`, `tool_request`, and
//! `get_pending_results`, plus the error-code taxonomy from the spec's
//! external-interfaces table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A loosely-typed argument value, sufficient to carry any JSON an agent
/// sends as a tool argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
}

/// A request id, either the client's literal `"auth-1"` or a monotonic
/// integer counter for every request after that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Str(String),
    Num(u64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Str(s) => f.write_str(s),
            RequestId::Num(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// The error-code taxonomy from the external-interfaces table. Each variant
/// carries its own wire code via [`GatewayError::code`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
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
    #[error("gateway is shutting down")]
    GatewayShutdown,
    #[error("method not found: {0}")]
    MethodNotFound(String),
}

impl GatewayError {
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::DeniedByUser => -32001,
            GatewayError::ApprovalTimeout => -32002,
            GatewayError::PolicyDenied(_) => -32003,
            GatewayError::ExecutionFailed(_) => -32004,
            GatewayError::AuthFailed => -32005,
            GatewayError::RateLimited => -32006,
            // Not part of the numbered taxonomy in the external-interfaces
            // table; a "gateway is shutting down" deny cause is a generic
            // server error as far as the wire format is concerned.
            GatewayError::GatewayShutdown => -32000,
            // Standard JSON-RPC 2.0 method-not-found code, not part of the
            // gateway's own numbered taxonomy.
            GatewayError::MethodNotFound(_) => -32601,
        }
    }
}

impl From<GatewayError> for RpcError {
    fn from(e: GatewayError) -> Self {
        RpcError {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// A decoded `tool_request` call.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequestParams {
    pub tool: String,
    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,
}

/// A decoded `auth` call.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthParams {
    pub token: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

fn default_agent_id() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrips_both_shapes() {
        let str_id: RequestId = serde_json::from_str("\"auth-1\"").unwrap();
        assert_eq!(str_id, RequestId::Str("auth-1".to_string()));
        let num_id: RequestId = serde_json::from_str("2").unwrap();
        assert_eq!(num_id, RequestId::Num(2));
    }

    #[test]
    fn gateway_error_codes_match_table() {
        assert_eq!(GatewayError::DeniedByUser.code(), -32001);
        assert_eq!(GatewayError::ApprovalTimeout.code(), -32002);
        assert_eq!(GatewayError::PolicyDenied("x".into()).code(), -32003);
        assert_eq!(GatewayError::ExecutionFailed("x".into()).code(), -32004);
        assert_eq!(GatewayError::AuthFailed.code(), -32005);
        assert_eq!(GatewayError::RateLimited.code(), -32006);
        assert_eq!(GatewayError::MethodNotFound("x".into()).code(), -32601);
    }
}
