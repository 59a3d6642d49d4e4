// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::tool_call::ToolCall;

/// How long an approval request stays valid before housekeeping expires it.
pub const APPROVAL_TTL_MINUTES: i64 = 30;

/// A pending human decision, published via webhook and resolved by an
/// inbound response or a timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Process-unique id, minted from a cryptographically random UUID.
    pub id: Uuid,

    pub tool_call: ToolCall,

    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(tool_call: ToolCall) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tool_call,
            created_at: now,
            expires_at: now + Duration::minutes(APPROVAL_TTL_MINUTES),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// The approver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    #[serde(rename = "APPROVE")]
    Approve,
    #[serde(rename = "DENY")]
    Deny,
}

/// Inbound response body delivered by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub request_id: Uuid,

    pub decision: ApprovalDecision,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}

/// Outcome handed to the waiter once a response resolves the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlResult {
    pub approved: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,

    /// Milliseconds from request creation to resolution.
    pub response_time_ms: i64,
}
