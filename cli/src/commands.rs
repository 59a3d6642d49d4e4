// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Policy authoring commands
//!
//! Commands: init, validate, test

use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde_json::{Map, Value};
use std::path::PathBuf;

use agentguard_core::application::PolicyEvaluator;
use agentguard_core::domain::ToolCall;
use agentguard_core::infrastructure::policy_loader;

pub fn init(path: PathBuf) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, refusing to overwrite", path.display());
    }

    std::fs::write(&path, policy_loader::generate_sample_policy())
        .with_context(|| format!("Failed to write policy to {}", path.display()))?;

    println!(
        "{}",
        format!("✓ Sample policy written: {}", path.display()).green()
    );
    Ok(())
}

pub fn validate(path: PathBuf) -> Result<()> {
    println!("Validating {}...", path.display());

    let policy =
        policy_loader::load_policy_file(&path).context("Policy validation failed")?;

    println!("{}", "✓ Policy is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Name: {}", policy.name);
    println!("  Version: {}", policy.version);
    if let Some(description) = &policy.description {
        println!("  Description: {}", description);
    }
    println!("  Default action: {}", policy.default_action);
    println!("  Rules: {}", policy.rules.len());
    for rule in policy.rules_by_priority() {
        println!(
            "    [{}] {} → {} ({} condition{})",
            rule.priority,
            rule.name.bold(),
            rule.action,
            rule.conditions.len(),
            if rule.conditions.len() == 1 { "" } else { "s" }
        );
    }
    match &policy.webhook {
        Some(webhook) => {
            println!("  Webhook: {}", webhook.url);
            println!(
                "  Security: {}",
                if webhook.security.is_some() {
                    "signing enabled"
                } else {
                    "none"
                }
            );
        }
        None => println!("  Webhook: {}", "(none)".dimmed()),
    }

    Ok(())
}

pub fn test(path: PathBuf, tool_name: String, params: Vec<String>) -> Result<()> {
    let policy = policy_loader::load_policy_file(&path).context("Failed to load policy")?;

    let mut parameters = Map::new();
    for param in &params {
        let (key, value) = parse_param(param)?;
        parameters.insert(key, value);
    }

    let tool_call = ToolCall::new(tool_name.as_str(), parameters);
    let decision = PolicyEvaluator::decide(&policy, &tool_call);

    let action = match decision.action {
        agentguard_core::domain::PolicyAction::Allow => "ALLOW".green().bold(),
        agentguard_core::domain::PolicyAction::Block => "BLOCK".red().bold(),
        agentguard_core::domain::PolicyAction::RequireApproval => {
            "REQUIRE APPROVAL".yellow().bold()
        }
    };

    println!("Tool: {}", tool_name.bold());
    println!("Decision: {}", action);
    println!("Reason: {}", decision.reason);
    if let Some(rule) = &decision.matched_rule {
        println!("Matched rule: {} (priority {})", rule.name, rule.priority);
        if let Some(description) = &rule.description {
            println!("  {}", description.dimmed());
        }
    }

    Ok(())
}

/// Split `key=value`, parsing the value as JSON when possible and falling
/// back to a plain string.
fn parse_param(input: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = input.split_once('=') else {
        bail!("parameter '{}' is not in key=value form", input);
    };
    if key.is_empty() {
        bail!("parameter '{}' has an empty key", input);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param_json_values() {
        assert_eq!(parse_param("amount=50").unwrap().1, json!(50));
        assert_eq!(parse_param("safe=true").unwrap().1, json!(true));
        assert_eq!(
            parse_param("items=[1,2,3]").unwrap().1,
            json!([1, 2, 3])
        );
        assert_eq!(
            parse_param("user={\"role\":\"admin\"}").unwrap().1,
            json!({"role": "admin"})
        );
    }

    #[test]
    fn test_parse_param_falls_back_to_string() {
        assert_eq!(parse_param("to=alice").unwrap().1, json!("alice"));
        assert_eq!(
            parse_param("path=/workspace/x.txt").unwrap().1,
            json!("/workspace/x.txt")
        );
        // value containing '=' keeps everything after the first one
        assert_eq!(parse_param("q=a=b").unwrap().1, json!("a=b"));
    }

    #[test]
    fn test_parse_param_rejects_malformed_input() {
        assert!(parse_param("no-equals-sign").is_err());
        assert!(parse_param("=value").is_err());
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(init(file.path().to_path_buf()).is_err());
    }

    #[test]
    fn test_init_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        init(path.clone()).unwrap();
        validate(path.clone()).unwrap();
        test(path, "transfer".to_string(), vec!["amount=50".to_string()]).unwrap();
    }
}
