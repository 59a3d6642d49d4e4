// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy shared by the guard, evaluator, coordinator and envelope.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::policy::MatchedRule;
use crate::domain::tool_call::ToolCall;

#[derive(Debug, Error)]
pub enum GuardError {
    /// A wrapped tool was called before `initialize()` completed.
    #[error("guard is not initialized; call initialize() first")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing file, malformed document or failed validation.
    #[error("failed to load policy: {0}")]
    PolicyLoad(String),

    /// The call was blocked by a rule, the default action, or a denial.
    #[error("policy violation on '{}': {reason}", .tool_call.tool_name)]
    PolicyViolation {
        rule: MatchedRule,
        tool_call: Box<ToolCall>,
        reason: String,
    },

    #[error("approval request {request_id} timed out after {timeout_ms}ms")]
    ApprovalTimeout { request_id: Uuid, timeout_ms: u64 },

    #[error("approval request {request_id} was cancelled: {reason}")]
    ApprovalCancelled { request_id: Uuid, reason: String },

    /// Webhook dispatch exhausted its retries.
    #[error("webhook delivery failed after {attempts} attempt(s): {reason}")]
    WebhookFailed { attempts: u32, reason: String },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("request id mismatch: expected {expected}, got {got}")]
    RequestIdMismatch { expected: String, got: String },

    #[error("duplicate nonce '{nonce}': possible replay")]
    DuplicateNonce { nonce: String },

    /// Response for an id the registry does not know; no side effects.
    #[error("unknown approval request id: {0}")]
    UnknownRequestId(String),

    /// The coordinator was destroyed while the request was outstanding.
    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("encryption failure: {0}")]
    Encryption(String),

    /// Error surfaced by the underlying tool after an allow decision,
    /// propagated unchanged.
    #[error(transparent)]
    Tool(#[from] anyhow::Error),
}

impl GuardError {
    /// Whether this error terminated the call before the tool ran.
    pub fn blocked_before_invocation(&self) -> bool {
        !matches!(self, GuardError::Tool(_))
    }
}
