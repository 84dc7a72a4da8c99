//! Gateway configuration: the YAML config document, environment-variable
//! substitution, and load-time validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    pub messenger: MessengerConfig,
    pub services: ServicesConfig,
    pub storage: StorageConfig,
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_approval_timeout() -> u64 {
    900
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Allows serving plaintext when no `tls` section is present. Defaults
    /// to false — an absent `tls` section is a config error unless this is
    /// set.
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessengerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: i64,
    pub allowed_users: Vec<i64>,
    #[serde(default)]
    pub audit_ignored_presses: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_pending_approvals")]
    pub max_pending_approvals: usize,
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_pending_approvals: default_max_pending_approvals(),
            max_requests_per_minute: default_max_requests_per_minute(),
        }
    }
}

fn default_max_pending_approvals() -> usize {
    10
}

fn default_max_requests_per_minute() -> u32 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    pub homeassistant: HomeAssistantServiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeAssistantServiceConfig {
    pub url: String,
    pub token: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let substituted = substitute_env(&raw);
        let config: Config =
            serde_yaml::from_str(&substituted).context("invalid config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.storage.kind != "sqlite" {
            bail!("storage.type must be 'sqlite', got '{}'", self.storage.kind);
        }
        if self.messenger.kind != "telegram" {
            bail!(
                "messenger.type must be 'telegram', got '{}'",
                self.messenger.kind
            );
        }
        let telegram = self
            .messenger
            .telegram
            .as_ref()
            .context("messenger.telegram config is required when messenger.type is 'telegram'")?;
        if telegram.token.is_empty() {
            bail!("messenger.telegram.token must not be empty");
        }
        if telegram.allowed_users.is_empty() {
            bail!("messenger.telegram.allowed_users must not be empty");
        }
        if self.approval_timeout == 0 {
            bail!("approval_timeout must be positive");
        }
        if self.agent.token.is_empty() {
            bail!("agent.token must not be empty");
        }
        if self.gateway.tls.is_none() && !self.gateway.insecure {
            bail!("gateway.tls is required unless gateway.insecure is set");
        }
        Ok(())
    }
}

/// Replace every `${VAR}` occurrence with the value of the environment
/// variable `VAR`. Variables that aren't set are left untouched — the
/// resulting document will then fail schema validation with a clearer
/// error than a silent empty string would.
fn substitute_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '$' && raw[i + 1..].starts_with('{') {
            if let Some(end) = raw[i + 2..].find('}') {
                let name = &raw[i + 2..i + 2 + end];
                if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    if let Ok(value) = std::env::var(name) {
                        out.push_str(&value);
                    } else {
                        out.push_str(&raw[i..i + 3 + end]);
                    }
                    for _ in 0..end + 2 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_env_vars() {
        std::env::set_var("KEEPGATE_TEST_VAR", "hunter2");
        let out = substitute_env("token: ${KEEPGATE_TEST_VAR}");
        assert_eq!(out, "token: hunter2");
        std::env::remove_var("KEEPGATE_TEST_VAR");
    }

    #[test]
    fn leaves_unset_vars_untouched() {
        let out = substitute_env("token: ${KEEPGATE_DEFINITELY_UNSET_VAR}");
        assert_eq!(out, "token: ${KEEPGATE_DEFINITELY_UNSET_VAR}");
    }

    fn minimal_yaml() -> String {
        r#"
gateway:
  host: "0.0.0.0"
  port: 8443
  insecure: true
agent:
  token: "secret"
storage:
  type: sqlite
  path: /tmp/keepgate-test.db
messenger:
  type: telegram
  telegram:
    token: "abc"
    chat_id: 12345
    allowed_users: [1]
services:
  homeassistant:
    url: "http://homeassistant.local:8123"
    token: "ha-token"
approval_timeout: 60
"#
        .to_string()
    }

    #[test]
    fn rejects_wrong_storage_type() {
        let yaml = minimal_yaml().replace("type: sqlite", "type: postgres");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let config: Config = serde_yaml::from_str(&minimal_yaml()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_allowed_users() {
        let yaml = minimal_yaml().replace("allowed_users: [1]", "allowed_users: []");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_tls_without_insecure_flag() {
        let yaml = minimal_yaml().replace("insecure: true", "insecure: false");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_tls_section_in_place_of_insecure_flag() {
        let yaml = minimal_yaml().replace(
            "insecure: true",
            "tls:\n    cert: /tmp/cert.pem\n    key: /tmp/key.pem",
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_approval_timeout() {
        let yaml = minimal_yaml().replace("approval_timeout: 60", "approval_timeout: 0");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_approval_timeout_is_900_seconds() {
        let yaml = minimal_yaml().replace("approval_timeout: 60\n", "");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.approval_timeout, 900);
    }

    #[test]
    fn default_rate_limit_matches_spec_defaults() {
        let config: Config = serde_yaml::from_str(&minimal_yaml()).unwrap();
        assert_eq!(config.rate_limit.max_pending_approvals, 10);
        assert_eq!(config.rate_limit.max_requests_per_minute, 60);
    }
}
