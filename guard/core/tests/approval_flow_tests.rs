// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Approval-gate tests without a security envelope: resolution, denial,
//! webhook-less operation and dispatch retry behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentguard_core::application::{tool_fn, AgentGuard, GuardConfig, ProtectOptions, Tool};
use agentguard_core::domain::{
    ApprovalDecision, ApprovalResponse, GuardError, Policy, WebhookConfig,
};
use agentguard_core::infrastructure::webhook::{HttpResponse, HttpSender};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

/// Records every attempt and replays scripted outcomes; once the script is
/// exhausted it answers 200.
struct RecordingSender {
    outcomes: Mutex<Vec<anyhow::Result<HttpResponse>>>,
    requests: Mutex<Vec<(String, HashMap<String, String>, Vec<u8>)>>,
}

impl RecordingSender {
    fn scripted(outcomes: Vec<anyhow::Result<HttpResponse>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn attempt_count(&self) -> usize {
        self.requests.lock().len()
    }

    async fn captured_request_id(&self, index: usize) -> Uuid {
        for _ in 0..200 {
            {
                let requests = self.requests.lock();
                if let Some((_, _, body)) = requests.get(index) {
                    let payload: serde_json::Value = serde_json::from_slice(body).unwrap();
                    return payload["request"]["id"].as_str().unwrap().parse().unwrap();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("webhook request {} never captured", index);
    }
}

#[async_trait]
impl HttpSender for RecordingSender {
    async fn send(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        _timeout: Duration,
    ) -> anyhow::Result<HttpResponse> {
        self.requests
            .lock()
            .push((url.to_string(), headers.clone(), body.to_vec()));
        let mut outcomes = self.outcomes.lock();
        if outcomes.is_empty() {
            Ok(HttpResponse {
                status: 200,
                body: Vec::new(),
            })
        } else {
            outcomes.remove(0)
        }
    }
}

fn approval_policy(webhook: Option<WebhookConfig>) -> Policy {
    serde_yaml::from_str::<Policy>(
        r#"
version: "1.0"
name: approval-everything
defaultAction: require_approval
rules: []
"#,
    )
    .map(|mut policy| {
        policy.webhook = webhook;
        policy
    })
    .unwrap()
}

fn webhook(retries: u32) -> WebhookConfig {
    WebhookConfig {
        url: "https://hooks.example.com/approvals".to_string(),
        timeout_ms: 1_000,
        retries,
        headers: HashMap::new(),
        security: None,
    }
}

fn counting_tool() -> (Arc<AtomicUsize>, Arc<dyn Tool>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tool = tool_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("done"))
        }
    });
    (calls, tool)
}

fn respond(request_id: Uuid, decision: ApprovalDecision) -> ApprovalResponse {
    ApprovalResponse {
        request_id,
        decision,
        reason: Some("reviewed".to_string()),
        approved_by: Some("alice".to_string()),
    }
}

#[tokio::test]
async fn test_approval_gates_tool_execution() {
    let sender = RecordingSender::scripted(vec![]);
    let guard = AgentGuard::with_sender(
        GuardConfig::inline(approval_policy(Some(webhook(1))))
            .with_approval_timeout(Duration::from_secs(5)),
        sender.clone(),
    );
    guard.initialize().await.unwrap();

    let (calls, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();

    let pending_call = tokio::spawn(async move { protected.call(json!({"env": "prod"})).await });

    let request_id = sender.captured_request_id(0).await;
    // tool must not run until the decision lands
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    guard
        .handle_approval_response(&respond(request_id, ApprovalDecision::Approve), &HashMap::new())
        .await
        .unwrap();

    let result = pending_call.await.unwrap().unwrap();
    assert_eq!(result, json!("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(guard.get_pending_approvals().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_denial_is_a_policy_violation() {
    let sender = RecordingSender::scripted(vec![]);
    let guard = AgentGuard::with_sender(
        GuardConfig::inline(approval_policy(Some(webhook(1))))
            .with_approval_timeout(Duration::from_secs(5)),
        sender.clone(),
    );
    guard.initialize().await.unwrap();

    let (calls, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();
    let pending_call = tokio::spawn(async move { protected.call(json!({})).await });

    let request_id = sender.captured_request_id(0).await;
    guard
        .handle_approval_response(&respond(request_id, ApprovalDecision::Deny), &HashMap::new())
        .await
        .unwrap();

    let err = pending_call.await.unwrap().unwrap_err();
    let GuardError::PolicyViolation { reason, .. } = err else {
        panic!("expected PolicyViolation");
    };
    assert!(reason.contains("Approval denied"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_webhook_still_waits_for_local_response() {
    // neither the policy nor the config declares a webhook: nothing is
    // dispatched, but an in-process response resolves the wait
    let guard = AgentGuard::new(
        GuardConfig::inline(approval_policy(None)).with_approval_timeout(Duration::from_secs(5)),
    );
    guard.initialize().await.unwrap();

    let (calls, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();
    let pending_call = tokio::spawn(async move { protected.call(json!({})).await });

    let request_id = loop {
        let pending = guard.get_pending_approvals().await.unwrap();
        if let Some(info) = pending.first() {
            break info.request_id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    guard
        .handle_approval_response(&respond(request_id, ApprovalDecision::Approve), &HashMap::new())
        .await
        .unwrap();
    pending_call.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_policy_webhook_wins_over_config_webhook() {
    let sender = RecordingSender::scripted(vec![]);
    let mut policy_hook = webhook(1);
    policy_hook.url = "https://policy.example.com/hook".to_string();
    let mut config_hook = webhook(1);
    config_hook.url = "https://config.example.com/hook".to_string();

    let guard = AgentGuard::with_sender(
        GuardConfig::inline(approval_policy(Some(policy_hook)))
            .with_webhook(config_hook)
            .with_approval_timeout(Duration::from_millis(300)),
        sender.clone(),
    );
    guard.initialize().await.unwrap();

    let (_, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();
    let _ = protected.call(json!({})).await;

    let (url, _, _) = sender.requests.lock()[0].clone();
    assert_eq!(url, "https://policy.example.com/hook");
}

#[tokio::test(start_paused = true)]
async fn test_webhook_recovers_within_retry_budget() {
    let sender = RecordingSender::scripted(vec![
        Err(anyhow::anyhow!("connection refused")),
        Ok(HttpResponse {
            status: 502,
            body: Vec::new(),
        }),
        Ok(HttpResponse {
            status: 200,
            body: Vec::new(),
        }),
    ]);
    let guard = AgentGuard::with_sender(
        GuardConfig::inline(approval_policy(Some(webhook(3))))
            .with_approval_timeout(Duration::from_secs(30)),
        sender.clone(),
    );
    guard.initialize().await.unwrap();

    let (calls, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();
    let pending_call = tokio::spawn(async move { protected.call(json!({})).await });

    let request_id = sender.captured_request_id(2).await;
    assert_eq!(sender.attempt_count(), 3);

    guard
        .handle_approval_response(&respond(request_id, ApprovalDecision::Approve), &HashMap::new())
        .await
        .unwrap();
    pending_call.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_webhook_exhaustion_cleans_up_pending_entry() {
    let sender = RecordingSender::scripted(vec![
        Err(anyhow::anyhow!("connection refused")),
        Err(anyhow::anyhow!("connection refused")),
        Err(anyhow::anyhow!("connection refused")),
    ]);
    let guard = AgentGuard::with_sender(
        GuardConfig::inline(approval_policy(Some(webhook(3)))),
        sender.clone(),
    );
    guard.initialize().await.unwrap();

    let (calls, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();

    let err = protected.call(json!({})).await.unwrap_err();
    assert!(matches!(err, GuardError::WebhookFailed { attempts: 3, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // no orphaned waiter or registry entry
    assert!(guard.get_pending_approvals().await.unwrap().is_empty());
    assert_eq!(guard.get_stats().await.unwrap().pending_count, 0);
}

#[tokio::test]
async fn test_cancel_interrupts_inflight_call() {
    let sender = RecordingSender::scripted(vec![]);
    let guard = AgentGuard::with_sender(
        GuardConfig::inline(approval_policy(Some(webhook(1))))
            .with_approval_timeout(Duration::from_secs(30)),
        sender.clone(),
    );
    guard.initialize().await.unwrap();

    let (_, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();
    let pending_call = tokio::spawn(async move { protected.call(json!({})).await });

    let request_id = sender.captured_request_id(0).await;
    guard.cancel_approval(request_id, "operator abort").await.unwrap();

    let err = pending_call.await.unwrap().unwrap_err();
    assert!(matches!(err, GuardError::ApprovalCancelled { .. }));
}

#[tokio::test]
async fn test_shutdown_fails_inflight_calls() {
    let sender = RecordingSender::scripted(vec![]);
    let guard = AgentGuard::with_sender(
        GuardConfig::inline(approval_policy(Some(webhook(1))))
            .with_approval_timeout(Duration::from_secs(30)),
        sender.clone(),
    );
    guard.initialize().await.unwrap();

    let (_, tool) = counting_tool();
    let protected = guard.protect("deploy", tool, ProtectOptions::default()).unwrap();
    let pending_call = tokio::spawn(async move { protected.call(json!({})).await });

    sender.captured_request_id(0).await;
    guard.shutdown().await.unwrap();

    let err = pending_call.await.unwrap().unwrap_err();
    assert!(matches!(err, GuardError::ShuttingDown));
}
