//! The policy engine: matches a request signature against compiled glob
//! rules and returns a [`Decision`].
//!
//! Evaluation checks `rules` first, then `defaults`, then falls through to a
//! global `ask`. Within `rules`, three scans run in deny, allow, ask order:
//! a deny match anywhere in the list wins over an allow or ask match
//! anywhere else in that list, regardless of declaration order. This keeps
//! "this is always forbidden" rules safe to add without reasoning about
//! where existing allow rules sit. `defaults`, by contrast, is a plain
//! first-match-wins scan in declaration order regardless of action — it's
//! the broad fall-through layer, where authorship order is the natural way
//! to encode "try this, then that, then give up and ask."

use crate::policy::types::{Decision, Policy, Rule, RuleAction};
use crate::signature::Signature;
use globset::{Glob, GlobMatcher};

struct CompiledRule {
    matcher: GlobMatcher,
    rule: Rule,
}

/// A loaded policy with its glob patterns pre-compiled at construction
/// time, not on every request.
pub struct PolicyEngine {
    compiled_rules: Vec<CompiledRule>,
    compiled_defaults: Vec<CompiledRule>,
}

impl PolicyEngine {
    pub fn new(policy: &Policy) -> Result<Self, globset::Error> {
        Ok(Self {
            compiled_rules: compile(&policy.rules)?,
            compiled_defaults: compile(&policy.defaults)?,
        })
    }

    pub fn evaluate(&self, signature: &Signature) -> Decision {
        let text = signature.as_str();
        if let Some(decision) = scan_rules(&self.compiled_rules, text) {
            return decision;
        }
        if let Some(decision) = scan_defaults(&self.compiled_defaults, text) {
            return decision;
        }
        Decision::RequiresApproval { prompt: None }
    }
}

fn compile(rules: &[Rule]) -> Result<Vec<CompiledRule>, globset::Error> {
    rules
        .iter()
        .map(|rule| {
            let matcher = Glob::new(&rule.pattern)?.compile_matcher();
            Ok(CompiledRule {
                matcher,
                rule: rule.clone(),
            })
        })
        .collect()
}

/// `rules`: three passes in deny, allow, ask order; first match within a
/// pass wins.
fn scan_rules(rules: &[CompiledRule], signature: &str) -> Option<Decision> {
    for action in [RuleAction::Deny, RuleAction::Allow, RuleAction::Ask] {
        for compiled in rules.iter().filter(|c| c.rule.action == action) {
            if compiled.matcher.is_match(signature) {
                return Some(decision_for(&compiled.rule));
            }
        }
    }
    None
}

/// `defaults`: a single pass in declaration order; first match wins
/// regardless of its action.
fn scan_defaults(defaults: &[CompiledRule], signature: &str) -> Option<Decision> {
    defaults
        .iter()
        .find(|compiled| compiled.matcher.is_match(signature))
        .map(|compiled| decision_for(&compiled.rule))
}

fn decision_for(rule: &Rule) -> Decision {
    match rule.action {
        RuleAction::Allow => Decision::Allowed,
        RuleAction::Deny => Decision::Denied {
            reason: rule.describe(),
        },
        RuleAction::Ask => Decision::RequiresApproval {
            prompt: rule.description.clone(),
        },
    }
}
