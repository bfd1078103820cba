//! Feature-flag gating for primaries.
//!
//! A disabled flag routes the call straight to the fallback without touching
//! the breaker. [`StaticFlags`] is an in-memory gate with exact-key and regex
//! rules, percentage rollout and context conditions.

use bulwark_core::{ConfigError, OperationKey};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use xxhash_rust::xxh3::xxh3_64;

/// Caller attributes a gate may inspect (user id, tenant, environment).
pub type FlagContext = HashMap<String, serde_json::Value>;

/// Decides whether the primary path of an operation is enabled.
pub trait FeatureFlagGate: Send + Sync {
    fn is_enabled(&self, key: &OperationKey, context: &FlagContext) -> bool;
}

/// Gate that enables every primary.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl FeatureFlagGate for AlwaysEnabled {
    fn is_enabled(&self, _key: &OperationKey, _context: &FlagContext) -> bool {
        true
    }
}

/// Comparison applied by a [`FlagCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
    /// `value` is a two-element `[low, high]` array, bounds inclusive
    InRange,
}

/// A predicate over one context attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagCondition {
    pub attribute: String,

    pub operator: ConditionOperator,

    pub value: serde_json::Value,
}

impl FlagCondition {
    /// Missing attributes never match.
    pub fn matches(&self, context: &FlagContext) -> bool {
        let Some(actual) = context.get(&self.attribute) else {
            return false;
        };

        match self.operator {
            ConditionOperator::Equals => actual == &self.value,
            ConditionOperator::Contains => as_text(actual).contains(&as_text(&self.value)),
            ConditionOperator::GreaterThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOperator::LessThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            ConditionOperator::InRange => {
                let bounds = self.value.as_array().map(|b| b.as_slice());
                match (actual.as_f64(), bounds) {
                    (Some(a), Some([low, high])) => match (low.as_f64(), high.as_f64()) {
                        (Some(low), Some(high)) => a >= low && a <= high,
                        _ => false,
                    },
                    _ => false,
                }
            }
        }
    }
}

fn as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One flag rule. `name` matches a key exactly; `pattern`, when set, matches
/// keys by regex instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRule {
    pub name: String,

    #[serde(default)]
    pub pattern: Option<String>,

    pub enabled: bool,

    /// Share of contexts admitted, 0..=100. `None` admits all.
    #[serde(default)]
    pub rollout_percentage: Option<u8>,

    #[serde(default)]
    pub conditions: Vec<FlagCondition>,

    #[serde(default)]
    pub description: Option<String>,
}

impl FlagRule {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            pattern: None,
            enabled,
            rollout_percentage: None,
            conditions: Vec::new(),
            description: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_rollout(mut self, percentage: u8) -> Self {
        self.rollout_percentage = Some(percentage.min(100));
        self
    }

    pub fn with_condition(mut self, condition: FlagCondition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// Result of evaluating a key against the rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagEvaluation {
    pub enabled: bool,

    /// Name of the matching rule, `None` when the default applied
    pub rule: Option<String>,

    pub reason: String,
}

struct CompiledRule {
    rule: FlagRule,
    pattern: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: FlagRule) -> Result<Self, ConfigError> {
        let pattern = match &rule.pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| ConfigError::InvalidValue {
                field: format!("flags.{}.pattern", rule.name),
                reason: e.to_string(),
            })?),
            None => None,
        };
        Ok(Self { rule, pattern })
    }

    fn matches_exact(&self, key: &OperationKey) -> bool {
        self.pattern.is_none() && self.rule.name == key.as_str()
    }

    fn matches_pattern(&self, key: &OperationKey) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(key.as_str()))
    }
}

/// In-memory rule set. Exact-name rules win over pattern rules; among
/// pattern rules the first added wins.
pub struct StaticFlags {
    rules: RwLock<Vec<CompiledRule>>,
    default_enabled: bool,
}

impl StaticFlags {
    /// Empty rule set; unmatched keys resolve to `default_enabled`.
    pub fn new(default_enabled: bool) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_enabled,
        }
    }

    pub fn from_rules(default_enabled: bool, rules: Vec<FlagRule>) -> Result<Self, ConfigError> {
        let flags = Self::new(default_enabled);
        for rule in rules {
            flags.set(rule)?;
        }
        Ok(flags)
    }

    /// Insert or replace a rule by name.
    pub fn set(&self, rule: FlagRule) -> Result<(), ConfigError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.rule.name == compiled.rule.name) {
            Some(existing) => *existing = compiled,
            None => rules.push(compiled),
        }
        Ok(())
    }

    /// Enable a rule, creating it if needed. Returns whether a rule changed.
    pub fn enable(&self, name: &str) -> bool {
        self.toggle(name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        self.toggle(name, false)
    }

    fn toggle(&self, name: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.rule.name == name) {
            Some(existing) => {
                let changed = existing.rule.enabled != enabled;
                existing.rule.enabled = enabled;
                changed
            }
            None => {
                rules.push(CompiledRule {
                    rule: FlagRule::new(name, enabled),
                    pattern: None,
                });
                true
            }
        }
    }

    /// Clamp to 0..=100. Returns `false` if no rule has that name.
    pub fn set_rollout(&self, name: &str, percentage: u8) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.rule.name == name) {
            Some(existing) => {
                existing.rule.rollout_percentage = Some(percentage.min(100));
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.rule.name != name);
        rules.len() != before
    }

    pub fn rules(&self) -> Vec<FlagRule> {
        self.rules.read().iter().map(|r| r.rule.clone()).collect()
    }

    /// Evaluate `key` and say why.
    pub fn evaluate(&self, key: &OperationKey, context: &FlagContext) -> FlagEvaluation {
        let rules = self.rules.read();
        let matched = rules
            .iter()
            .find(|r| r.matches_exact(key))
            .or_else(|| rules.iter().find(|r| r.matches_pattern(key)));

        let Some(compiled) = matched else {
            return FlagEvaluation {
                enabled: self.default_enabled,
                rule: None,
                reason: "no matching rule".to_string(),
            };
        };
        let rule = &compiled.rule;
        let denied = |reason: String| FlagEvaluation {
            enabled: false,
            rule: Some(rule.name.clone()),
            reason,
        };

        if !rule.enabled {
            return denied("flag disabled".to_string());
        }

        if let Some(percentage) = rule.rollout_percentage.filter(|p| *p < 100) {
            let bucket = rollout_bucket(&rule.name, key, context);
            if bucket >= u32::from(percentage) {
                return denied(format!("rollout bucket {} >= {}%", bucket, percentage));
            }
        }

        if let Some(failed) = rule.conditions.iter().find(|c| !c.matches(context)) {
            return denied(format!("condition failed on '{}'", failed.attribute));
        }

        FlagEvaluation {
            enabled: true,
            rule: Some(rule.name.clone()),
            reason: "all conditions met".to_string(),
        }
    }
}

impl FeatureFlagGate for StaticFlags {
    fn is_enabled(&self, key: &OperationKey, context: &FlagContext) -> bool {
        let evaluation = self.evaluate(key, context);
        tracing::debug!(
            key = %key,
            enabled = evaluation.enabled,
            rule = ?evaluation.rule,
            reason = %evaluation.reason,
            "Evaluated feature flag"
        );
        evaluation.enabled
    }
}

impl Default for StaticFlags {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Stable bucket in 0..100 for (rule, key, context).
///
/// The context is hashed through a `BTreeMap` so attribute order does not
/// change the bucket.
fn rollout_bucket(rule: &str, key: &OperationKey, context: &FlagContext) -> u32 {
    let ordered: BTreeMap<&String, &serde_json::Value> = context.iter().collect();
    let encoded = serde_json::to_string(&ordered).unwrap_or_default();

    let mut bytes = Vec::with_capacity(rule.len() + key.as_str().len() + encoded.len() + 2);
    bytes.extend_from_slice(rule.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(key.as_str().as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(encoded.as_bytes());

    (xxh3_64(&bytes) % 100) as u32
}
