// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Webhook dispatch - bounded-retry delivery of approval requests
//!
//! The HTTP transport is behind [`HttpSender`] so tests can inject a
//! recording stub; the default implementation is a thin reqwest client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::approval::ApprovalRequest;
use crate::domain::errors::GuardError;
use crate::domain::policy::WebhookConfig;
use crate::infrastructure::security::{SecurityEnvelope, SECURITY_HEADERS, USER_AGENT};

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Send bytes to a URL with headers, receive a status. One call is one
/// attempt, bounded by `timeout`.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        timeout: Duration,
    ) -> anyhow::Result<HttpResponse>;
}

/// Default transport over a shared reqwest client.
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn send(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        timeout: Duration,
    ) -> anyhow::Result<HttpResponse> {
        let mut request = self.client.post(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(body.to_vec()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

/// Delivers approval requests to the configured endpoint with exponential
/// backoff between attempts.
pub struct WebhookDispatcher {
    config: WebhookConfig,
    security: Option<Arc<SecurityEnvelope>>,
    sender: Arc<dyn HttpSender>,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig, sender: Arc<dyn HttpSender>) -> Result<Self, GuardError> {
        let security = match &config.security {
            Some(security_config) => Some(Arc::new(SecurityEnvelope::from_config(security_config)?)),
            None => None,
        };
        Ok(Self {
            config,
            security,
            sender,
        })
    }

    /// The security envelope shared with the response path, if configured.
    pub fn security(&self) -> Option<&Arc<SecurityEnvelope>> {
        self.security.as_ref()
    }

    /// Build, sign and deliver the approval-request payload.
    ///
    /// Retries up to the configured attempt count with `2^(attempt-1)`
    /// seconds between attempts; non-2xx statuses, transport errors and
    /// timeouts all count as failures. Exhaustion surfaces as
    /// [`GuardError::WebhookFailed`].
    pub async fn dispatch(&self, request: &ApprovalRequest) -> Result<(), GuardError> {
        let mut payload = json!({
            "type": "approval_request",
            "request": request,
            "timestamp": Utc::now().to_rfc3339(),
        });

        if let (Some(envelope), Some(security_config)) = (&self.security, &self.config.security) {
            if security_config.encrypt_sensitive_data {
                envelope
                    .encrypt_sensitive_fields(&mut payload, &security_config.sensitive_fields)?;
            }
        }

        let body = serde_json::to_vec(&payload).map_err(|err| GuardError::WebhookFailed {
            attempts: 0,
            reason: format!("payload serialization failed: {}", err),
        })?;

        let headers = self.build_headers(&body, &request.id.to_string());
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let attempts = self.config.retries.max(1);

        let mut last_failure = String::new();
        for attempt in 1..=attempts {
            debug!(
                request_id = %request.id,
                url = %self.config.url,
                attempt,
                "Dispatching approval webhook"
            );
            match self
                .sender
                .send(&self.config.url, &headers, &body, timeout)
                .await
            {
                Ok(response) if response.is_success() => {
                    info!(
                        request_id = %request.id,
                        status = response.status,
                        attempt,
                        "Approval webhook delivered"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    last_failure = format!("endpoint returned status {}", response.status);
                }
                Err(err) => {
                    last_failure = err.to_string();
                }
            }

            warn!(
                request_id = %request.id,
                attempt,
                reason = %last_failure,
                "Approval webhook attempt failed"
            );
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
        }

        Err(GuardError::WebhookFailed {
            attempts,
            reason: last_failure,
        })
    }

    /// Defaults, then caller extras, then the security set; caller extras
    /// never override security headers.
    fn build_headers(&self, body: &[u8], request_id: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("User-Agent".to_string(), USER_AGENT.to_string());

        for (name, value) in &self.config.headers {
            headers.insert(name.clone(), value.clone());
        }

        if let Some(envelope) = &self.security {
            let security_headers = envelope.generate_headers(body, request_id);
            for name in SECURITY_HEADERS {
                if let Some(value) = security_headers.get(name) {
                    headers.insert(name.to_string(), value.clone());
                }
            }
        }

        headers
    }
}
