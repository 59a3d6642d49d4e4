// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod approval;
pub mod errors;
pub mod policy;
pub mod tool_call;

pub use approval::{ApprovalDecision, ApprovalRequest, ApprovalResponse, HitlResult};
pub use errors::GuardError;
pub use policy::{
    Condition, ConditionOperator, Decision, MatchedRule, Policy, PolicyAction, Rule,
    WebhookConfig, WebhookSecurityConfig,
};
pub use tool_call::ToolCall;
