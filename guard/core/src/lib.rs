// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # agentguard-core
//!
//! Policy-mediated call interception for agent tools. For every invocation
//! of a protected tool the guard computes allow, block or require-approval
//! from a declarative policy; approvals are orchestrated out-of-band over a
//! signed (and optionally encrypted) webhook channel.
//!
//! ## Layer Structure
//!
//! ```text
//! application/    ← guard orchestrator, evaluator, HITL coordinator
//!     ↓
//! domain/         ← tool calls, policy model, approvals, error taxonomy
//!     ↓
//! infrastructure/ ← YAML policy loader, webhook transport, security envelope
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use agentguard_core::application::{AgentGuard, GuardConfig, ProtectOptions, tool_fn};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), agentguard_core::domain::GuardError> {
//! let guard = AgentGuard::new(GuardConfig::from_file("policy.yaml"));
//! guard.initialize().await?;
//!
//! let transfer = tool_fn(|params| async move { Ok(params) });
//! let protected = guard.protect("transfer", transfer, ProtectOptions::default())?;
//!
//! let receipt = protected.call(json!({"amount": 50, "to": "alice"})).await?;
//! # let _ = receipt; Ok(())
//! # }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{AgentGuard, GuardConfig, ProtectOptions, ProtectedTool, Tool};
pub use domain::{GuardError, Policy, PolicyAction, ToolCall};
