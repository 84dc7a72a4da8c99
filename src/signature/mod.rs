//! Deterministic signature construction for tool requests.
//!
//! A signature projects a `(tool, args)` pair into a single string that the
//! policy engine matches glob patterns against. Construction is pure and
//! total: the same request always yields the same signature, and no
//! request is rejected here — rejection is the validator's job.

use crate::gateway::protocol::ArgValue;
use std::collections::BTreeMap;
use std::fmt;

/// Home Assistant entity/service/domain/event identifiers follow
/// `lower (_|lower|digit)* ("." (lower|digit|_)+)?` — one optional dotted
/// suffix, never starting with a digit or underscore.
fn matches_ha_identifier_grammar(s: &str) -> bool {
    fn head_ok(s: &str) -> bool {
        let mut chars = s.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
    match s.split_once('.') {
        Some((head, tail)) => {
            !tail.is_empty()
                && !tail.contains('.')
                && head_ok(head)
                && tail.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => head_ok(s),
    }
}

/// Fields whose string values must additionally pass the Home Assistant
/// identifier grammar, for any tool whose name carries the `ha_` prefix —
/// regardless of whether this particular tool projects that field into its
/// signature.
const HA_IDENTITY_FIELDS: [&str; 4] = ["entity_id", "domain", "service", "event_type"];

/// Policy-glob metacharacters: letting any of these through a string argument
/// would let a request smuggle glob syntax into the signature the policy
/// engine matches against.
const FORBIDDEN_CHARS: [char; 7] = ['*', '?', '[', ']', '(', ')', ','];

/// C0 control bytes (0x00-0x1F) are rejected outright, in addition to the
/// glob metacharacters above.
fn is_forbidden_control_byte(c: char) -> bool {
    (c as u32) < 0x20
}

/// A projected, pattern-matchable request signature.
///
/// Deliberately not a bare `String` — a `Signature` can only come from
/// [`build`], so a caller can't smuggle an unvalidated string into the
/// policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("argument '{0}' contains a forbidden character")]
    ForbiddenChar(String),
    #[error("argument '{arg}' is not a valid Home Assistant identifier: {value}")]
    InvalidHaIdentifier { arg: String, value: String },
}

/// Build the signature string for a tool call.
///
/// Known tools (`call-service`/`get-state`/`get-states`/`fire-event`) get a
/// tool-specific projection; unknown tools project every arg in key-sorted
/// order. Parts are joined by `", "`; an empty parts list emits the bare
/// tool name with no parentheses.
pub fn build(tool: &str, args: &BTreeMap<String, ArgValue>) -> Signature {
    let parts: Vec<String> = match tool {
        "ha_call_service" => {
            let domain = string_arg(args, "domain").unwrap_or_default();
            let service = string_arg(args, "service").unwrap_or_default();
            let entity_id = string_arg(args, "entity_id").unwrap_or_default();
            vec![format!("{domain}.{service}"), entity_id.to_string()]
        }
        "ha_get_state" => {
            let entity_id = string_arg(args, "entity_id").unwrap_or_default();
            vec![entity_id.to_string()]
        }
        "ha_get_states" => vec![],
        "ha_fire_event" => {
            let event_type = string_arg(args, "event_type").unwrap_or_default();
            vec![event_type.to_string()]
        }
        // BTreeMap already iterates in key-sorted order.
        _ => args.values().map(project_value).collect(),
    };

    let sig = if parts.is_empty() {
        tool.to_string()
    } else {
        format!("{tool}({})", parts.join(", "))
    };
    Signature(sig)
}

fn string_arg<'a>(args: &'a BTreeMap<String, ArgValue>, key: &str) -> Option<&'a str> {
    match args.get(key) {
        Some(ArgValue::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn project_value(value: &ArgValue) -> String {
    match value {
        ArgValue::String(s) => s.clone(),
        ArgValue::Int(i) => i.to_string(),
        ArgValue::Bool(b) => b.to_string(),
        ArgValue::List(items) => {
            let joined = items.iter().map(project_value).collect::<Vec<_>>().join(",");
            format!("[{joined}]")
        }
        ArgValue::Map(map) => {
            let joined = map
                .iter()
                .map(|(k, v)| format!("{k}:{}", project_value(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{joined}}}")
        }
    }
}

/// Validate that a request's arguments are safe to project and dispatch.
///
/// Every string-valued argument, at any nesting depth, is scanned for
/// policy-glob metacharacters and C0 control bytes. Additionally, for any
/// tool whose name carries the home-controller prefix (`ha_`), a top-level
/// `entity_id`/`domain`/`service`/`event_type` string argument must match
/// Home Assistant's identifier grammar — whether or not this particular
/// tool actually projects that field into its signature. Non-string values
/// are passed through unvalidated.
pub fn validate(tool: &str, args: &BTreeMap<String, ArgValue>) -> Result<(), SignatureError> {
    let is_ha_tool = tool.starts_with("ha_");

    for (key, value) in args {
        check_forbidden(key, value)?;
        if is_ha_tool && HA_IDENTITY_FIELDS.contains(&key.as_str()) {
            if let ArgValue::String(s) = value {
                if !s.is_empty() && !matches_ha_identifier_grammar(s) {
                    return Err(SignatureError::InvalidHaIdentifier {
                        arg: key.clone(),
                        value: s.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_forbidden(key: &str, value: &ArgValue) -> Result<(), SignatureError> {
    match value {
        ArgValue::String(s) => {
            if s.chars().any(|c| FORBIDDEN_CHARS.contains(&c) || is_forbidden_control_byte(c)) {
                return Err(SignatureError::ForbiddenChar(key.to_string()));
            }
            Ok(())
        }
        ArgValue::List(items) => {
            for item in items {
                check_forbidden(key, item)?;
            }
            Ok(())
        }
        ArgValue::Map(map) => {
            for (k, v) in map {
                check_forbidden(k, v)?;
            }
            Ok(())
        }
        ArgValue::Int(_) | ArgValue::Bool(_) => Ok(()),
    }
}
