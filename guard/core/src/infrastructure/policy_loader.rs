// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Policy file adapter - YAML in, validated [`Policy`] out

use std::path::Path;

use tracing::info;

use crate::domain::errors::GuardError;
use crate::domain::policy::Policy;

/// Read, parse and validate a policy document from disk.
pub fn load_policy_file(path: impl AsRef<Path>) -> Result<Policy, GuardError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|err| {
        GuardError::PolicyLoad(format!("cannot read {}: {}", path.display(), err))
    })?;
    let policy = parse_policy_yaml(&text)?;
    info!(
        path = %path.display(),
        policy = %policy.name,
        rules = policy.rules.len(),
        "Policy loaded"
    );
    Ok(policy)
}

/// Parse and validate a policy document. Unknown operators and actions are
/// rejected by deserialization; structural rules by [`Policy::validate`].
pub fn parse_policy_yaml(text: &str) -> Result<Policy, GuardError> {
    let policy: Policy = serde_yaml::from_str(text)
        .map_err(|err| GuardError::PolicyLoad(format!("malformed policy document: {}", err)))?;
    policy.validate()?;
    Ok(policy)
}

/// A fully annotated starter policy.
pub fn generate_sample_policy() -> &'static str {
    SAMPLE_POLICY
}

const SAMPLE_POLICY: &str = r#"# AgentGuard policy
#
# Rules are evaluated in descending priority; declaration order breaks
# ties. The first rule whose conditions all match decides the call; with no
# match, defaultAction applies.
version: "1.0"
name: starter-policy
description: Tiered guard for money-moving tools

# allow | block | require_approval
defaultAction: block

rules:
  # Small transfers go straight through.
  - name: allow-small-transfers
    description: Transfers up to 100 need no review
    priority: 10
    action: allow
    conditions:
      - field: toolCall.toolName
        operator: equals
        value: transfer
      - field: toolCall.parameters.amount
        operator: lte
        value: 100

  # Mid-size transfers page a human.
  - name: escalate-large-transfers
    priority: 20
    action: require_approval
    conditions:
      - field: toolCall.toolName
        operator: equals
        value: transfer
      - field: toolCall.parameters.amount
        operator: gt
        value: 100
      - field: toolCall.parameters.amount
        operator: lte
        value: 10000

  # Anything bigger is refused outright.
  - name: block-huge-transfers
    priority: 30
    action: block
    conditions:
      - field: toolCall.toolName
        operator: equals
        value: transfer
      - field: toolCall.parameters.amount
        operator: gt
        value: 10000

  # Read-style tools are always safe.
  - name: allow-reads
    priority: 5
    action: allow
    conditions:
      - field: toolCall.toolName
        operator: regex
        value: "^(read|get|list|fetch)_[a-z]+$"

# Where approval requests are delivered. Remove this block to keep
# approvals local (requests then wait for responses delivered in-process).
webhook:
  url: https://hooks.example.com/agentguard
  timeoutMs: 10000
  retries: 3
  headers:
    X-Team: payments
  security:
    # At least 32 bytes.
    signingSecret: change-me-to-a-32-byte-or-longer-secret
    # 32 bytes, hex-encoded (64 hex chars). Required when
    # encryptSensitiveData is true.
    encryptionKey: "0000000000000000000000000000000000000000000000000000000000000000"
    encryptSensitiveData: true
    sensitiveFields:
      - request.toolCall.parameters.apiKey
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::PolicyAction;
    use std::io::Write;

    #[test]
    fn test_sample_policy_parses_and_validates() {
        let policy = parse_policy_yaml(generate_sample_policy()).unwrap();
        assert_eq!(policy.default_action, PolicyAction::Block);
        assert_eq!(policy.rules.len(), 4);
        let webhook = policy.webhook.unwrap();
        assert!(webhook.security.unwrap().encrypt_sensitive_data);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_policy_file("/no/such/policy.yaml").unwrap_err();
        assert!(matches!(err, GuardError::PolicyLoad(msg) if msg.contains("/no/such/policy.yaml")));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(generate_sample_policy().as_bytes()).unwrap();
        let policy = load_policy_file(file.path()).unwrap();
        assert_eq!(policy.name, "starter-policy");
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = parse_policy_yaml(
            r#"
version: "1.0"
name: bad
defaultAction: allow
rules:
  - name: r
    action: allow
    conditions:
      - field: toolCall.toolName
        operator: matchesGlob
        value: "*"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GuardError::PolicyLoad(_)));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = parse_policy_yaml(
            r#"
version: "1.0"
name: bad
defaultAction: shrug
rules: []
"#,
        )
        .unwrap_err();
        assert!(matches!(err, GuardError::PolicyLoad(_)));
    }

    #[test]
    fn test_missing_required_keys_rejected() {
        assert!(parse_policy_yaml("name: only-a-name").is_err());
        assert!(parse_policy_yaml("version: \"1.0\"\nname: x\nrules: []").is_err());
    }
}
