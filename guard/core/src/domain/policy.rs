// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Policy model - declarative rules mapping tool calls to decisions
//!
//! A `Policy` is loaded once (YAML via the infrastructure loader or inline)
//! and treated as read-only for the lifetime of a guard. Rules are applied
//! in descending priority order; ties keep declaration order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::errors::GuardError;

/// The decision set shared by rules, default actions and evaluator verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Block,
    #[serde(alias = "requireApproval")]
    RequireApproval,
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Block => write!(f, "block"),
            Self::RequireApproval => write!(f, "require_approval"),
        }
    }
}

/// Comparison applied by a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    Gt,
    Lt,
    Gte,
    Lte,
}

/// A single field comparison. All conditions of a rule must match (AND).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the evaluation context
    /// (e.g. `toolCall.parameters.user.role`, `toolCall.parameters.items.0.id`).
    pub field: String,

    pub operator: ConditionOperator,

    /// Operator-specific payload.
    pub value: Value,
}

/// A named, prioritized decision rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique-enough name, surfaced in diagnostics and violations.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Higher priority wins; absent means 0.
    #[serde(default)]
    pub priority: i64,

    pub action: PolicyAction,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Webhook endpoint configuration for approval dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,

    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of delivery attempts (at least 1 is always made).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Extra headers merged under the security set.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<WebhookSecurityConfig>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retries() -> u32 {
    3
}

/// Signing and encryption settings for the webhook channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSecurityConfig {
    /// HMAC-SHA-256 key, at least 32 bytes.
    pub signing_secret: String,

    /// AES-256-GCM key: 32 raw bytes, hex-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    #[serde(default)]
    pub encrypt_sensitive_data: bool,

    /// Dotted paths into the outgoing payload whose leaves get encrypted
    /// (e.g. `request.toolCall.parameters.apiKey`).
    #[serde(default)]
    pub sensitive_fields: Vec<String>,
}

/// The guard's declarative policy: an ordered rule list plus a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub version: String,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Applied when no rule matches.
    pub default_action: PolicyAction,

    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

impl Policy {
    /// Rules in evaluation order: descending priority, stable on ties.
    pub fn rules_by_priority(&self) -> Vec<&Rule> {
        let mut ordered: Vec<&Rule> = self.rules.iter().collect();
        ordered.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        ordered
    }

    /// Validate the loaded document beyond what serde enforces.
    ///
    /// Rejects empty identifiers, operator payloads of the wrong shape,
    /// non-compiling regex patterns, malformed webhook URLs and undersized
    /// or non-hex security keys. Conditions rejected here are never seen by
    /// the evaluator.
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.name.trim().is_empty() {
            return Err(GuardError::PolicyLoad("policy name must not be empty".into()));
        }
        if self.version.trim().is_empty() {
            return Err(GuardError::PolicyLoad("policy version must not be empty".into()));
        }

        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(GuardError::PolicyLoad("rule name must not be empty".into()));
            }
            for condition in &rule.conditions {
                validate_condition(&rule.name, condition)?;
            }
        }

        if let Some(webhook) = &self.webhook {
            validate_webhook(webhook)?;
        }

        Ok(())
    }
}

fn validate_condition(rule_name: &str, condition: &Condition) -> Result<(), GuardError> {
    if condition.field.trim().is_empty() {
        return Err(GuardError::PolicyLoad(format!(
            "rule '{}': condition field must not be empty",
            rule_name
        )));
    }

    match condition.operator {
        ConditionOperator::In => {
            if !condition.value.is_array() {
                return Err(GuardError::PolicyLoad(format!(
                    "rule '{}': 'in' operator requires an array value",
                    rule_name
                )));
            }
        }
        ConditionOperator::Gt
        | ConditionOperator::Lt
        | ConditionOperator::Gte
        | ConditionOperator::Lte => {
            let numeric = match &condition.value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            };
            if !numeric {
                return Err(GuardError::PolicyLoad(format!(
                    "rule '{}': numeric operator requires a numeric value",
                    rule_name
                )));
            }
        }
        ConditionOperator::Regex => {
            let Some(pattern) = condition.value.as_str() else {
                return Err(GuardError::PolicyLoad(format!(
                    "rule '{}': 'regex' operator requires a string pattern",
                    rule_name
                )));
            };
            if let Err(err) = regex::Regex::new(pattern) {
                return Err(GuardError::PolicyLoad(format!(
                    "rule '{}': invalid regex pattern: {}",
                    rule_name, err
                )));
            }
        }
        _ => {}
    }

    Ok(())
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), GuardError> {
    let parsed = url::Url::parse(&webhook.url)
        .map_err(|err| GuardError::PolicyLoad(format!("invalid webhook url: {}", err)))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(GuardError::PolicyLoad(format!(
            "webhook url must be http(s), got '{}'",
            parsed.scheme()
        )));
    }

    if let Some(security) = &webhook.security {
        if security.signing_secret.len() < 32 {
            return Err(GuardError::PolicyLoad(
                "webhook signing secret must be at least 32 bytes".into(),
            ));
        }
        if let Some(key) = &security.encryption_key {
            match hex::decode(key) {
                Ok(bytes) if bytes.len() == 32 => {}
                Ok(bytes) => {
                    return Err(GuardError::PolicyLoad(format!(
                        "webhook encryption key must decode to 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                Err(err) => {
                    return Err(GuardError::PolicyLoad(format!(
                        "webhook encryption key is not valid hex: {}",
                        err
                    )));
                }
            }
        }
        if security.encrypt_sensitive_data && security.encryption_key.is_none() {
            return Err(GuardError::PolicyLoad(
                "encryptSensitiveData requires an encryptionKey".into(),
            ));
        }
    }

    Ok(())
}

/// The rule a decision was derived from, carried in diagnostics and
/// `PolicyViolation` errors. When the default action applied, a synthetic
/// descriptor named `default` stands in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedRule {
    pub name: String,
    pub priority: i64,
    pub action: PolicyAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MatchedRule {
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            name: rule.name.clone(),
            priority: rule.priority,
            action: rule.action,
            description: rule.description.clone(),
        }
    }

    /// Descriptor for the policy default action.
    pub fn default_action(action: PolicyAction) -> Self {
        Self {
            name: "default".to_string(),
            priority: i64::MIN,
            action,
            description: Some("policy default action".to_string()),
        }
    }
}

/// The evaluator's verdict for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: PolicyAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<MatchedRule>,
    pub reason: String,
}
