// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HITL coordinator - registry of pending approvals and response demux
//!
//! Owns the pending-request registry, the webhook dispatcher binding and
//! the nonce replay cache. Responses may arrive before a waiter attaches;
//! the registry buffers them so out-of-order delivery never loses a
//! decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::approval::{ApprovalDecision, ApprovalRequest, ApprovalResponse, HitlResult};
use crate::domain::errors::GuardError;
use crate::domain::policy::WebhookConfig;
use crate::domain::tool_call::ToolCall;
use crate::infrastructure::security::NonceCache;
use crate::infrastructure::webhook::{HttpSender, WebhookDispatcher};

/// Consumed nonces are remembered for this long.
const NONCE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// How often the background task evicts stale nonces.
const NONCE_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

type WaiterSlot = oneshot::Sender<Result<HitlResult, GuardError>>;

/// Waiter state of one registry entry. Transitions at most once into a
/// terminal state; terminal entries are removed from the registry.
enum WaiterState {
    /// Created, no waiter attached yet.
    None,
    /// A waiter is blocked on the result.
    Waiting(WaiterSlot),
    /// A response arrived before the waiter attached.
    ResolvedEarly(HitlResult),
}

struct PendingEntry {
    request: ApprovalRequest,
    state: WaiterState,
}

/// Snapshot of one pending request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalInfo {
    pub request_id: Uuid,
    pub tool_name: String,
    pub created_at: chrono::DateTime<Utc>,
    pub expires_at: chrono::DateTime<Utc>,
    pub waiting: bool,
}

/// Registry-level counters for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlStats {
    pub pending_count: usize,
    pub oldest_age_ms: i64,
    pub average_age_ms: i64,
}

/// Registry of pending approvals plus the webhook dispatcher.
///
/// One coordinator per guard; invocations share it concurrently. The
/// registry mutex only guards map access; webhook I/O and waiting happen
/// outside it.
pub struct HitlCoordinator {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    nonce_cache: Arc<NonceCache>,
    dispatcher: Option<WebhookDispatcher>,
    destroyed: parking_lot::Mutex<bool>,
    sweep_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HitlCoordinator {
    /// Bind the coordinator to the effective webhook config. With `None`
    /// nothing is dispatched; approval requests are still registered and
    /// wait for an externally delivered response.
    pub fn new(
        webhook: Option<WebhookConfig>,
        sender: Arc<dyn HttpSender>,
    ) -> Result<Self, GuardError> {
        let dispatcher = match webhook {
            Some(config) => Some(WebhookDispatcher::new(config, sender)?),
            None => None,
        };

        let nonce_cache = Arc::new(NonceCache::new(NONCE_WINDOW));
        let sweep_cache = nonce_cache.clone();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(NONCE_SWEEP_INTERVAL);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                sweep_cache.sweep();
                debug!("Nonce cache swept");
            }
        });

        Ok(Self {
            pending: Mutex::new(HashMap::new()),
            nonce_cache,
            dispatcher,
            destroyed: parking_lot::Mutex::new(false),
            sweep_task: parking_lot::Mutex::new(Some(sweep_task)),
        })
    }

    /// Register a pending approval and dispatch the webhook if one is
    /// configured.
    ///
    /// The entry is published *before* dispatch, so a response racing ahead
    /// of the waiter always finds it. Exhausted dispatch retries remove the
    /// entry again and surface as [`GuardError::WebhookFailed`].
    pub async fn create_approval_request(&self, tool_call: ToolCall) -> Result<Uuid, GuardError> {
        if *self.destroyed.lock() {
            return Err(GuardError::ShuttingDown);
        }

        let request = ApprovalRequest::new(tool_call);
        let request_id = request.id;

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                request_id,
                PendingEntry {
                    request: request.clone(),
                    state: WaiterState::None,
                },
            );
        }

        info!(
            request_id = %request_id,
            tool = %request.tool_call.tool_name,
            expires_at = %request.expires_at,
            "Approval request created"
        );

        if let Some(dispatcher) = &self.dispatcher {
            if let Err(err) = dispatcher.dispatch(&request).await {
                self.pending.lock().await.remove(&request_id);
                return Err(err);
            }
        }

        Ok(request_id)
    }

    /// Block until the request resolves, times out or is cancelled.
    ///
    /// An early response stored before the waiter attached is returned
    /// immediately. The registry mutex is never held while blocked.
    pub async fn wait_for_approval(
        &self,
        request_id: Uuid,
        timeout: Duration,
    ) -> Result<HitlResult, GuardError> {
        let receiver = {
            let mut pending = self.pending.lock().await;
            let mut entry = pending
                .remove(&request_id)
                .ok_or_else(|| GuardError::UnknownRequestId(request_id.to_string()))?;

            match entry.state {
                WaiterState::ResolvedEarly(result) => {
                    debug!(request_id = %request_id, "Early response consumed by waiter");
                    return Ok(result);
                }
                WaiterState::Waiting(waiter) => {
                    entry.state = WaiterState::Waiting(waiter);
                    pending.insert(request_id, entry);
                    return Err(GuardError::InvalidArgument(format!(
                        "request {} already has a waiter",
                        request_id
                    )));
                }
                WaiterState::None => {
                    let (tx, rx) = oneshot::channel();
                    entry.state = WaiterState::Waiting(tx);
                    pending.insert(request_id, entry);
                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a result: the coordinator went away.
            Ok(Err(_)) => Err(GuardError::ShuttingDown),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                if pending.remove(&request_id).is_some() {
                    warn!(request_id = %request_id, timeout_ms = timeout.as_millis() as u64, "Approval request timed out");
                }
                Err(GuardError::ApprovalTimeout {
                    request_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Demultiplex an inbound approval response.
    ///
    /// With security configured the headers are validated first (presence,
    /// timestamp format, request-id match, signature) and only then is the
    /// nonce consumed, so a forged replay never burns a nonce. The result
    /// is delivered to the waiter, or parked as an early response when no
    /// waiter has attached yet.
    pub async fn handle_approval_response(
        &self,
        response: &ApprovalResponse,
        headers: &HashMap<String, String>,
    ) -> Result<(), GuardError> {
        let request_id = response.request_id;

        let created_at = {
            let pending = self.pending.lock().await;
            let entry = pending
                .get(&request_id)
                .ok_or_else(|| GuardError::UnknownRequestId(request_id.to_string()))?;
            entry.request.created_at
        };

        if let Some(envelope) = self.dispatcher.as_ref().and_then(|d| d.security()) {
            let body = serde_json::to_vec(response).map_err(|err| {
                GuardError::InvalidSignature(format!("response serialization failed: {}", err))
            })?;
            let verified = envelope.validate_response(&body, headers, &request_id.to_string())?;

            if !self.nonce_cache.insert(&verified.nonce) {
                return Err(GuardError::DuplicateNonce {
                    nonce: verified.nonce,
                });
            }
        }

        let result = HitlResult {
            approved: response.decision == ApprovalDecision::Approve,
            reason: response.reason.clone(),
            approved_by: response.approved_by.clone(),
            response_time_ms: (Utc::now() - created_at).num_milliseconds(),
        };

        let mut pending = self.pending.lock().await;
        let Some(mut entry) = pending.remove(&request_id) else {
            // resolved or expired while the security checks ran
            return Err(GuardError::UnknownRequestId(request_id.to_string()));
        };

        match entry.state {
            WaiterState::Waiting(waiter) => {
                info!(
                    request_id = %request_id,
                    approved = result.approved,
                    response_time_ms = result.response_time_ms,
                    "Approval response resolved a waiter"
                );
                // waiter may have timed out between our checks; nothing to do
                let _ = waiter.send(Ok(result));
            }
            WaiterState::None => {
                debug!(request_id = %request_id, "Approval response parked before waiter attached");
                entry.state = WaiterState::ResolvedEarly(result);
                pending.insert(request_id, entry);
            }
            WaiterState::ResolvedEarly(_) => {
                warn!(
                    request_id = %request_id,
                    "Duplicate approval response, overwriting earlier early result"
                );
                entry.state = WaiterState::ResolvedEarly(result);
                pending.insert(request_id, entry);
            }
        }

        Ok(())
    }

    /// Remove an entry; a blocked waiter fails with `ApprovalCancelled`.
    /// A second call for the same id reports `UnknownRequestId`.
    pub async fn cancel_approval(
        &self,
        request_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), GuardError> {
        let reason = reason.into();
        let mut pending = self.pending.lock().await;
        let entry = pending
            .remove(&request_id)
            .ok_or_else(|| GuardError::UnknownRequestId(request_id.to_string()))?;

        info!(request_id = %request_id, reason = %reason, "Approval request cancelled");
        if let WaiterState::Waiting(waiter) = entry.state {
            let _ = waiter.send(Err(GuardError::ApprovalCancelled { request_id, reason }));
        }
        Ok(())
    }

    /// Drop entries past their expiry; blocked waiters fail with
    /// `ApprovalTimeout`. Returns how many entries were removed.
    pub async fn cleanup_expired_requests(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.pending.lock().await;
        let expired: Vec<Uuid> = pending
            .iter()
            .filter(|(_, entry)| entry.request.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        for request_id in &expired {
            let entry = pending.remove(request_id).expect("id collected above");
            warn!(request_id = %request_id, "Expired approval request removed");
            if let WaiterState::Waiting(waiter) = entry.state {
                let ttl = entry.request.expires_at - entry.request.created_at;
                let _ = waiter.send(Err(GuardError::ApprovalTimeout {
                    request_id: *request_id,
                    timeout_ms: ttl.num_milliseconds().max(0) as u64,
                }));
            }
        }
        expired.len()
    }

    pub async fn get_pending_approvals(&self) -> Vec<PendingApprovalInfo> {
        let pending = self.pending.lock().await;
        pending
            .values()
            .map(|entry| PendingApprovalInfo {
                request_id: entry.request.id,
                tool_name: entry.request.tool_call.tool_name.clone(),
                created_at: entry.request.created_at,
                expires_at: entry.request.expires_at,
                waiting: matches!(entry.state, WaiterState::Waiting(_)),
            })
            .collect()
    }

    pub async fn get_stats(&self) -> HitlStats {
        let now = Utc::now();
        let pending = self.pending.lock().await;
        let ages: Vec<i64> = pending
            .values()
            .map(|entry| (now - entry.request.created_at).num_milliseconds())
            .collect();

        HitlStats {
            pending_count: ages.len(),
            oldest_age_ms: ages.iter().copied().max().unwrap_or(0),
            average_age_ms: if ages.is_empty() {
                0
            } else {
                ages.iter().sum::<i64>() / ages.len() as i64
            },
        }
    }

    /// Stop the sweep task and fail every outstanding waiter with a
    /// shutdown error. Subsequent `create_approval_request` calls fail.
    pub async fn destroy(&self) {
        *self.destroyed.lock() = true;
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }

        let mut pending = self.pending.lock().await;
        let drained: Vec<(Uuid, PendingEntry)> = pending.drain().collect();
        drop(pending);

        for (request_id, entry) in drained {
            if let WaiterState::Waiting(waiter) = entry.state {
                let _ = waiter.send(Err(GuardError::ShuttingDown));
            }
            debug!(request_id = %request_id, "Pending approval dropped on destroy");
        }
        info!("HITL coordinator destroyed");
    }
}

impl Drop for HitlCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
    }
}
