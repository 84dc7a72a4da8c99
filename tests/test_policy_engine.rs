//! Fixture-driven policy engine tests, mirroring a realistic
//! `permissions.yaml` for a home-automation gateway.

use keepgate::policy::{parser::parse_policy, PolicyEngine};
use keepgate::signature;
use std::collections::BTreeMap;

const FIXTURE: &str = r#"
rules:
  - pattern: "ha_call_service(lock.*, *)"
    action: deny
    description: "never remotely operate locks"
  - pattern: "ha_call_service(homeassistant.restart, *)"
    action: ask
    description: "confirm before restarting Home Assistant"
  - pattern: "ha_get_state*"
    action: allow
defaults:
  - pattern: "*"
    action: ask
"#;

fn engine() -> PolicyEngine {
    let policy = parse_policy(FIXTURE).unwrap();
    PolicyEngine::new(&policy).unwrap()
}

fn call_service(service: &str, entity_id: &str) -> keepgate::signature::Signature {
    let (domain, service_name) = service.split_once('.').unwrap_or((service, ""));
    let mut args = BTreeMap::new();
    args.insert(
        "domain".to_string(),
        keepgate::gateway::protocol::ArgValue::String(domain.to_string()),
    );
    args.insert(
        "service".to_string(),
        keepgate::gateway::protocol::ArgValue::String(service_name.to_string()),
    );
    args.insert(
        "entity_id".to_string(),
        keepgate::gateway::protocol::ArgValue::String(entity_id.to_string()),
    );
    signature::build("ha_call_service", &args)
}

#[test]
fn deny_rule_blocks_lock_operations() {
    let engine = engine();
    let sig = call_service("lock.unlock", "lock.front_door");
    assert!(engine.evaluate(&sig).is_denied());
}

#[test]
fn ask_rule_requires_approval_for_restart() {
    let engine = engine();
    let sig = call_service("homeassistant.restart", "");
    assert!(engine.evaluate(&sig).is_requires_approval());
}

#[test]
fn allow_rule_permits_state_reads() {
    let engine = engine();
    let mut args = BTreeMap::new();
    args.insert(
        "entity_id".to_string(),
        keepgate::gateway::protocol::ArgValue::String("sensor.temperature".to_string()),
    );
    let sig = signature::build("ha_get_state", &args);
    assert!(engine.evaluate(&sig).is_allowed());
}

#[test]
fn unmatched_service_call_falls_through_to_default_ask() {
    let engine = engine();
    let sig = call_service("light.turn_on", "light.kitchen");
    assert!(engine.evaluate(&sig).is_requires_approval());
}

#[test]
fn evaluation_order_is_first_come_for_equal_priority_matches() {
    let policy = parse_policy(
        r#"
rules:
  - pattern: "ha_call_service(lock.lock, *)"
    action: allow
defaults: []
"#,
    )
    .unwrap();
    let engine = PolicyEngine::new(&policy).unwrap();
    let sig = call_service("lock.lock", "lock.front_door");
    assert!(engine.evaluate(&sig).is_allowed());
}
