//! YAML permissions-file loader.
//!
//! Parses the `rules`/`defaults` permissions document into a [`Policy`],
//! validating every glob pattern at load time so a malformed pattern is
//! reported before the gateway ever accepts a connection.

use crate::policy::types::Policy;
use anyhow::{Context, Result};
use globset::Glob;
use std::path::Path;

pub fn load_policy(path: &Path) -> Result<Policy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading permissions file {}", path.display()))?;
    parse_policy(&raw).with_context(|| format!("parsing permissions file {}", path.display()))
}

pub fn parse_policy(yaml: &str) -> Result<Policy> {
    let policy: Policy = serde_yaml::from_str(yaml).context("invalid permissions YAML")?;
    for rule in policy.rules.iter().chain(policy.defaults.iter()) {
        Glob::new(&rule.pattern)
            .with_context(|| format!("invalid glob pattern '{}'", rule.pattern))?;
    }
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::RuleAction;

    #[test]
    fn parses_rules_and_defaults() {
        let yaml = r#"
rules:
  - pattern: "ha_call_service(lock.*, *)"
    action: deny
    description: "never touch locks"
  - pattern: "ha_get_state(*)"
    action: allow
defaults:
  - pattern: "*"
    action: ask
"#;
        let policy = parse_policy(yaml).unwrap();
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].action, RuleAction::Deny);
        assert_eq!(policy.defaults.len(), 1);
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let policy = parse_policy("rules: []").unwrap();
        assert!(policy.rules.is_empty());
        assert!(policy.defaults.is_empty());
    }

    #[test]
    fn invalid_glob_pattern_is_rejected() {
        let yaml = r#"
rules:
  - pattern: "["
    action: deny
"#;
        assert!(parse_policy(yaml).is_err());
    }
}
