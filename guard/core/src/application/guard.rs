// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Guard orchestrator - wraps tools and runs the decision pipeline
//!
//! For each invocation of a protected tool the guard snapshots a
//! [`ToolCall`], asks the evaluator for a decision, and dispatches to the
//! underlying tool, a policy violation, or the HITL coordinator.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::application::evaluator::PolicyEvaluator;
use crate::application::hitl::{HitlCoordinator, HitlStats, PendingApprovalInfo};
use crate::domain::approval::{ApprovalResponse, APPROVAL_TTL_MINUTES};
use crate::domain::errors::GuardError;
use crate::domain::policy::{MatchedRule, Policy, PolicyAction, WebhookConfig};
use crate::domain::tool_call::ToolCall;
use crate::infrastructure::policy_loader;
use crate::infrastructure::webhook::{HttpSender, ReqwestSender};

/// A tool takes one structured value and produces one. Tools are opaque to
/// the guard; their errors propagate unchanged through an allow decision.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, params: Value) -> anyhow::Result<Value>;
}

struct FnTool<F>(F);

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, params: Value) -> anyhow::Result<Value> {
        (self.0)(params).await
    }
}

/// Adapt an async closure into a [`Tool`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn Tool>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnTool(f))
}

/// Where the guard's policy comes from.
pub enum PolicySource {
    /// Re-readable path; enables `reload_policy`.
    File(PathBuf),
    /// Fixed in-memory policy.
    Inline(Policy),
}

/// Guard construction parameters.
pub struct GuardConfig {
    pub policy: PolicySource,

    /// Fallback webhook used when the policy does not declare one.
    pub webhook: Option<WebhookConfig>,

    /// How long a single invocation waits for an approval decision.
    pub approval_timeout: Duration,
}

impl GuardConfig {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            policy: PolicySource::File(path.into()),
            webhook: None,
            approval_timeout: Duration::from_secs(APPROVAL_TTL_MINUTES as u64 * 60),
        }
    }

    pub fn inline(policy: Policy) -> Self {
        Self {
            policy: PolicySource::Inline(policy),
            webhook: None,
            approval_timeout: Duration::from_secs(APPROVAL_TTL_MINUTES as u64 * 60),
        }
    }

    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }
}

/// Caller identity attached to every call made through one protected tool.
#[derive(Debug, Clone, Default)]
pub struct ProtectOptions {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

struct GuardState {
    policy: Arc<Policy>,
    hitl: Arc<HitlCoordinator>,
}

struct GuardInner {
    config: GuardConfig,
    sender: Arc<dyn HttpSender>,
    state: parking_lot::RwLock<Option<GuardState>>,
    init_lock: parking_lot::Mutex<()>,
}

/// The policy-mediated call interceptor.
///
/// One policy per guard instance; guards are isolated from each other.
/// Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct AgentGuard {
    inner: Arc<GuardInner>,
}

impl AgentGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self::with_sender(config, Arc::new(ReqwestSender::new()))
    }

    /// Inject the HTTP transport (tests use a recording stub).
    pub fn with_sender(config: GuardConfig, sender: Arc<dyn HttpSender>) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                config,
                sender,
                state: parking_lot::RwLock::new(None),
                init_lock: parking_lot::Mutex::new(()),
            }),
        }
    }

    /// Load the policy and bind the HITL coordinator to the effective
    /// webhook configuration. Idempotent; concurrent calls initialize once.
    pub async fn initialize(&self) -> Result<(), GuardError> {
        let _init = self.inner.init_lock.lock();
        if self.inner.state.read().is_some() {
            return Ok(());
        }

        let policy = Arc::new(self.load_policy()?);

        // A policy-embedded webhook wins over the config-level one. With
        // neither, approvals are registered but nothing is dispatched.
        let effective_webhook = policy
            .webhook
            .clone()
            .or_else(|| self.inner.config.webhook.clone());

        let hitl = Arc::new(HitlCoordinator::new(
            effective_webhook,
            self.inner.sender.clone(),
        )?);

        info!(
            policy = %policy.name,
            version = %policy.version,
            rules = policy.rules.len(),
            "Guard initialized"
        );
        *self.inner.state.write() = Some(GuardState { policy, hitl });
        Ok(())
    }

    /// Wrap a tool. The wrapper carries an immutable guard marker and a
    /// reference to the original callable; calling it runs the pipeline.
    pub fn protect(
        &self,
        tool_name: impl Into<String>,
        tool: Arc<dyn Tool>,
        options: ProtectOptions,
    ) -> Result<ProtectedTool, GuardError> {
        let tool_name = tool_name.into();
        if tool_name.trim().is_empty() {
            return Err(GuardError::InvalidArgument(
                "tool name must not be empty".into(),
            ));
        }
        Ok(ProtectedTool {
            tool_name,
            underlying: tool,
            options,
            inner: self.inner.clone(),
        })
    }

    /// Re-read and validate the policy file and atomically replace the
    /// policy pointer. In-flight evaluations keep the snapshot they
    /// observed. Only valid for file-based guards.
    pub async fn reload_policy(&self) -> Result<(), GuardError> {
        if !matches!(self.inner.config.policy, PolicySource::File(_)) {
            return Err(GuardError::InvalidArgument(
                "reload_policy requires a file-based policy source".into(),
            ));
        }
        let policy = Arc::new(self.load_policy()?);

        let mut state = self.inner.state.write();
        let Some(state) = state.as_mut() else {
            return Err(GuardError::NotInitialized);
        };
        info!(policy = %policy.name, version = %policy.version, "Policy reloaded");
        state.policy = policy;
        Ok(())
    }

    /// Current policy snapshot, for diagnostics.
    pub fn policy(&self) -> Result<Arc<Policy>, GuardError> {
        self.inner
            .state
            .read()
            .as_ref()
            .map(|state| state.policy.clone())
            .ok_or(GuardError::NotInitialized)
    }

    /// Deliver an inbound approval response to the coordinator.
    pub async fn handle_approval_response(
        &self,
        response: &ApprovalResponse,
        headers: &std::collections::HashMap<String, String>,
    ) -> Result<(), GuardError> {
        self.hitl()?.handle_approval_response(response, headers).await
    }

    pub async fn cancel_approval(
        &self,
        request_id: uuid::Uuid,
        reason: impl Into<String>,
    ) -> Result<(), GuardError> {
        self.hitl()?.cancel_approval(request_id, reason).await
    }

    pub async fn get_pending_approvals(&self) -> Result<Vec<PendingApprovalInfo>, GuardError> {
        Ok(self.hitl()?.get_pending_approvals().await)
    }

    pub async fn get_stats(&self) -> Result<HitlStats, GuardError> {
        Ok(self.hitl()?.get_stats().await)
    }

    pub async fn cleanup_expired_requests(&self) -> Result<usize, GuardError> {
        Ok(self.hitl()?.cleanup_expired_requests().await)
    }

    /// Stop background work and fail all outstanding waiters.
    pub async fn shutdown(&self) -> Result<(), GuardError> {
        self.hitl()?.destroy().await;
        Ok(())
    }

    fn hitl(&self) -> Result<Arc<HitlCoordinator>, GuardError> {
        self.inner
            .state
            .read()
            .as_ref()
            .map(|state| state.hitl.clone())
            .ok_or(GuardError::NotInitialized)
    }

    fn load_policy(&self) -> Result<Policy, GuardError> {
        let policy = match &self.inner.config.policy {
            PolicySource::File(path) => policy_loader::load_policy_file(path)?,
            PolicySource::Inline(policy) => {
                policy.validate()?;
                policy.clone()
            }
        };
        Ok(policy)
    }
}

/// A guard-wrapped tool.
///
/// The guard marker and the reference to the original callable are fixed at
/// construction; there is no mutable access to either.
pub struct ProtectedTool {
    tool_name: String,
    underlying: Arc<dyn Tool>,
    options: ProtectOptions,
    inner: Arc<GuardInner>,
}

impl std::fmt::Debug for ProtectedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedTool")
            .field("tool_name", &self.tool_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ProtectedTool {
    /// Marker identifying guard-wrapped tools.
    pub fn is_guarded(&self) -> bool {
        true
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// The original, unwrapped callable.
    pub fn underlying(&self) -> &Arc<dyn Tool> {
        &self.underlying
    }

    /// Invoke with positional arguments, indexed `arg0, arg1, ...`.
    pub async fn call_with_args(&self, args: Vec<Value>) -> Result<Value, GuardError> {
        self.call(Value::Array(args)).await
    }

    /// Run the full pipeline: snapshot the call, evaluate, then invoke the
    /// tool, fail with a violation, or wait for a human decision.
    pub async fn call(&self, args: Value) -> Result<Value, GuardError> {
        let state = {
            let guard_state = self.inner.state.read();
            let Some(state) = guard_state.as_ref() else {
                return Err(GuardError::NotInitialized);
            };
            GuardState {
                policy: state.policy.clone(),
                hitl: state.hitl.clone(),
            }
        };

        let tool_call = ToolCall {
            tool_name: self.tool_name.clone(),
            parameters: ToolCall::parameters_from(args.clone()),
            agent_id: self.options.agent_id.clone(),
            session_id: self.options.session_id.clone(),
            metadata: self.options.metadata.clone(),
        };

        let decision = PolicyEvaluator::decide(&state.policy, &tool_call);
        debug!(
            tool = %tool_call.tool_name,
            action = %decision.action,
            reason = %decision.reason,
            "Guard decision"
        );

        match decision.action {
            PolicyAction::Allow => Ok(self.underlying.invoke(args).await?),
            PolicyAction::Block => {
                let rule = decision
                    .matched_rule
                    .unwrap_or_else(|| MatchedRule::default_action(PolicyAction::Block));
                Err(GuardError::PolicyViolation {
                    reason: decision.reason,
                    rule,
                    tool_call: Box::new(tool_call),
                })
            }
            PolicyAction::RequireApproval => {
                let request_id = state.hitl.create_approval_request(tool_call.clone()).await?;
                let result = state
                    .hitl
                    .wait_for_approval(request_id, self.inner.config.approval_timeout)
                    .await?;

                if result.approved {
                    info!(
                        request_id = %request_id,
                        tool = %tool_call.tool_name,
                        approved_by = ?result.approved_by,
                        "Approval granted, invoking tool"
                    );
                    Ok(self.underlying.invoke(args).await?)
                } else {
                    let rule = decision
                        .matched_rule
                        .unwrap_or_else(|| MatchedRule::default_action(PolicyAction::RequireApproval));
                    Err(GuardError::PolicyViolation {
                        reason: format!(
                            "Approval denied{}",
                            result
                                .reason
                                .map(|r| format!(": {}", r))
                                .unwrap_or_default()
                        ),
                        rule,
                        tool_call: Box::new(tool_call),
                    })
                }
            }
        }
    }
}
