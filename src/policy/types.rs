//! Policy data types: rules, decisions, and the permissions document shape.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Deny => write!(f, "deny"),
            RuleAction::Ask => write!(f, "ask"),
        }
    }
}

/// A single glob-pattern rule, matched against a request's signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Rule {
    pub fn describe(&self) -> String {
        match &self.description {
            Some(d) => format!("{} ({d})", self.pattern),
            None => self.pattern.clone(),
        }
    }
}

/// The loaded permissions document: explicit `rules` (checked first, in
/// order) and `defaults` (checked if no rule matches).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub defaults: Vec<Rule>,
}

/// The outcome of evaluating a request's signature against a [`Policy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { reason: String },
    RequiresApproval { prompt: Option<String> },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied { .. })
    }

    pub fn is_requires_approval(&self) -> bool {
        matches!(self, Decision::RequiresApproval { .. })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allowed => write!(f, "allowed"),
            Decision::Denied { reason } => write!(f, "denied: {reason}"),
            Decision::RequiresApproval { prompt } => match prompt {
                Some(p) => write!(f, "requires approval: {p}"),
                None => write!(f, "requires approval"),
            },
        }
    }
}
