// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Webhook security envelope - HMAC signing, freshness, AES-256-GCM field
//! encryption
//!
//! Pure computation over byte strings; the only state, the nonce replay
//! cache, is owned by the HITL coordinator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::errors::GuardError;
use crate::domain::policy::WebhookSecurityConfig;

pub const SIGNATURE_HEADER: &str = "x-agentguard-signature";
pub const TIMESTAMP_HEADER: &str = "x-agentguard-timestamp";
pub const NONCE_HEADER: &str = "x-agentguard-nonce";
pub const REQUEST_ID_HEADER: &str = "x-agentguard-request-id";

pub const SECURITY_HEADERS: [&str; 4] = [
    SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
    NONCE_HEADER,
    REQUEST_ID_HEADER,
];

pub const USER_AGENT: &str = "AgentGuard/1.0";

/// Accepted clock skew between signer and verifier.
const FRESHNESS_WINDOW_MS: i64 = 5 * 60 * 1000;

type HmacSha256 = Hmac<Sha256>;

/// AES-256-GCM with a 16-byte IV. The standard GCM IV is 12 bytes; existing
/// responders expect 16, so the envelope keeps that length on the wire.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 16;

/// Ciphertext replacement for a sensitive leaf value. All three components
/// are base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted: String,
    pub iv: String,
    pub tag: String,
}

/// Security header values extracted and verified from an inbound response.
#[derive(Debug, Clone)]
pub struct VerifiedHeaders {
    pub nonce: String,
    pub timestamp_ms: i64,
}

/// Signs outgoing payloads, verifies incoming ones, and encrypts nominated
/// sensitive fields.
pub struct SecurityEnvelope {
    signing_secret: Vec<u8>,
    encryption_key: Option<Vec<u8>>,
}

impl SecurityEnvelope {
    /// Build the envelope from a validated webhook security config.
    pub fn from_config(config: &WebhookSecurityConfig) -> Result<Self, GuardError> {
        if config.signing_secret.len() < 32 {
            return Err(GuardError::PolicyLoad(
                "webhook signing secret must be at least 32 bytes".into(),
            ));
        }
        let encryption_key = match &config.encryption_key {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key).map_err(|err| {
                    GuardError::PolicyLoad(format!("webhook encryption key is not valid hex: {}", err))
                })?;
                if bytes.len() != 32 {
                    return Err(GuardError::PolicyLoad(format!(
                        "webhook encryption key must decode to 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                Some(bytes)
            }
            None => None,
        };
        Ok(Self {
            signing_secret: config.signing_secret.as_bytes().to_vec(),
            encryption_key,
        })
    }

    pub fn has_encryption_key(&self) -> bool {
        self.encryption_key.is_some()
    }

    /// HMAC-SHA-256 over `timestampMs.nonce.requestId.payload`, hex-encoded.
    pub fn sign(&self, payload: &[u8], request_id: &str, timestamp_ms: i64, nonce: &str) -> String {
        hex::encode(self.hmac(payload, request_id, timestamp_ms, nonce))
    }

    fn hmac(&self, payload: &[u8], request_id: &str, timestamp_ms: i64, nonce: &str) -> Vec<u8> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.signing_secret)
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{}.{}.{}.", timestamp_ms, nonce, request_id).as_bytes());
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Verify a signature, rejecting stale timestamps first.
    ///
    /// The digest comparison is constant-time over equal-length inputs; a
    /// length mismatch (malformed hex) rejects early.
    pub fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        request_id: &str,
        timestamp_ms: i64,
        nonce: &str,
    ) -> Result<(), GuardError> {
        let now_ms = Utc::now().timestamp_millis();
        if (now_ms - timestamp_ms).abs() > FRESHNESS_WINDOW_MS {
            return Err(GuardError::InvalidSignature(
                "timestamp outside freshness window".into(),
            ));
        }

        let expected = self.hmac(payload, request_id, timestamp_ms, nonce);
        let provided = hex::decode(signature)
            .map_err(|_| GuardError::InvalidSignature("signature is not valid hex".into()))?;

        if provided.len() != expected.len() {
            return Err(GuardError::InvalidSignature("signature mismatch".into()));
        }
        if !bool::from(expected.ct_eq(&provided)) {
            return Err(GuardError::InvalidSignature("signature mismatch".into()));
        }
        Ok(())
    }

    /// Full security header set for an outgoing payload: a fresh timestamp,
    /// a fresh 16-byte random nonce, and the signature binding both to the
    /// request id and body.
    pub fn generate_headers(&self, payload: &[u8], request_id: &str) -> HashMap<String, String> {
        let timestamp_ms = Utc::now().timestamp_millis();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);

        let signature = self.sign(payload, request_id, timestamp_ms, &nonce);

        let mut headers = HashMap::new();
        headers.insert(SIGNATURE_HEADER.to_string(), signature);
        headers.insert(TIMESTAMP_HEADER.to_string(), timestamp_ms.to_string());
        headers.insert(NONCE_HEADER.to_string(), nonce);
        headers.insert(REQUEST_ID_HEADER.to_string(), request_id.to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("User-Agent".to_string(), USER_AGENT.to_string());
        headers
    }

    /// Validate an inbound response body against its security headers.
    ///
    /// Check order: header presence, timestamp format, request-id match,
    /// signature. Nonce uniqueness is checked afterwards by the caller so a
    /// forged replay never consumes the nonce.
    pub fn validate_response(
        &self,
        body: &[u8],
        headers: &HashMap<String, String>,
        expected_request_id: &str,
    ) -> Result<VerifiedHeaders, GuardError> {
        let lookup = |name: &str| -> Option<&str> {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        };

        let (Some(signature), Some(timestamp), Some(nonce), Some(request_id)) = (
            lookup(SIGNATURE_HEADER),
            lookup(TIMESTAMP_HEADER),
            lookup(NONCE_HEADER),
            lookup(REQUEST_ID_HEADER),
        ) else {
            return Err(GuardError::InvalidSignature(
                "missing required security headers".into(),
            ));
        };

        let timestamp_ms: i64 = timestamp.parse().map_err(|_| {
            GuardError::InvalidSignature("invalid timestamp format".into())
        })?;

        if request_id != expected_request_id {
            return Err(GuardError::RequestIdMismatch {
                expected: expected_request_id.to_string(),
                got: request_id.to_string(),
            });
        }

        self.verify(body, signature, request_id, timestamp_ms, nonce)?;

        Ok(VerifiedHeaders {
            nonce: nonce.to_string(),
            timestamp_ms,
        })
    }

    /// Encrypt one JSON value into its envelope. A fresh IV is drawn per
    /// call, so two encryptions of the same value differ.
    pub fn encrypt(&self, value: &Value) -> Result<EncryptedEnvelope, GuardError> {
        let key = self.encryption_key.as_deref().ok_or_else(|| {
            GuardError::Encryption("encryption key not configured".into())
        })?;
        let cipher = Aes256Gcm16::new_from_slice(key)
            .map_err(|_| GuardError::Encryption("invalid encryption key length".into()))?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let plaintext = serde_json::to_vec(&json!({ "value": value }))
            .map_err(|err| GuardError::Encryption(format!("serialization failed: {}", err)))?;

        let mut ciphertext = cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| GuardError::Encryption("encryption failed".into()))?;

        // AEAD output is ciphertext || tag
        let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        Ok(EncryptedEnvelope {
            encrypted: BASE64.encode(&ciphertext),
            iv: BASE64.encode(iv),
            tag: BASE64.encode(&tag),
        })
    }

    /// Invert [`Self::encrypt`]. GCM authentication failures surface as
    /// [`GuardError::Encryption`].
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Value, GuardError> {
        let key = self.encryption_key.as_deref().ok_or_else(|| {
            GuardError::Encryption("encryption key not configured".into())
        })?;
        let cipher = Aes256Gcm16::new_from_slice(key)
            .map_err(|_| GuardError::Encryption("invalid encryption key length".into()))?;

        let decode = |label: &str, input: &str| {
            BASE64
                .decode(input)
                .map_err(|err| GuardError::Encryption(format!("invalid {} encoding: {}", label, err)))
        };
        let iv = decode("iv", &envelope.iv)?;
        if iv.len() != IV_LEN {
            return Err(GuardError::Encryption(format!(
                "iv must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        let mut combined = decode("ciphertext", &envelope.encrypted)?;
        combined.extend(decode("tag", &envelope.tag)?);

        let plaintext = cipher
            .decrypt(Nonce::<U16>::from_slice(&iv), combined.as_slice())
            .map_err(|_| GuardError::Encryption("authentication failed".into()))?;

        let wrapper: Value = serde_json::from_slice(&plaintext)
            .map_err(|err| GuardError::Encryption(format!("invalid plaintext: {}", err)))?;
        wrapper
            .get("value")
            .cloned()
            .ok_or_else(|| GuardError::Encryption("plaintext missing value wrapper".into()))
    }

    /// Replace each resolvable leaf at `paths` in the outgoing payload with
    /// its encryption envelope. Intermediate structure and siblings are
    /// untouched; paths that do not resolve are silently skipped.
    pub fn encrypt_sensitive_fields(
        &self,
        payload: &mut Value,
        paths: &[String],
    ) -> Result<(), GuardError> {
        if self.encryption_key.is_none() {
            return Err(GuardError::Encryption("encryption key not configured".into()));
        }
        for path in paths {
            if let Some(leaf) = resolve_leaf_mut(payload, path) {
                let plain = leaf.take();
                let envelope = self.encrypt(&plain)?;
                *leaf = serde_json::to_value(envelope)
                    .map_err(|err| GuardError::Encryption(format!("envelope serialization failed: {}", err)))?;
            }
        }
        Ok(())
    }
}

fn resolve_leaf_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Replay cache: each nonce is accepted at most once within the window.
///
/// Lives in the HITL coordinator next to the pending-approval registry and
/// follows the same mutex discipline.
pub struct NonceCache {
    window: Duration,
    seen: parking_lot::Mutex<HashMap<String, Instant>>,
}

impl NonceCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a nonce; returns false when it was already consumed.
    pub fn insert(&self, nonce: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), Instant::now());
        true
    }

    /// Drop entries older than the window.
    pub fn sweep(&self) {
        let mut seen = self.seen.lock();
        let window = self.window;
        seen.retain(|_, inserted_at| inserted_at.elapsed() < window);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> SecurityEnvelope {
        SecurityEnvelope::from_config(&WebhookSecurityConfig {
            signing_secret: "a-signing-secret-of-at-least-32-bytes!".to_string(),
            encryption_key: Some(hex::encode([7u8; 32])),
            encrypt_sensitive_data: true,
            sensitive_fields: vec![],
        })
        .unwrap()
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let env = envelope();
        let now = Utc::now().timestamp_millis();
        let sig = env.sign(b"payload", "req-1", now, "nonce-1");
        assert!(env.verify(b"payload", &sig, "req-1", now, "nonce-1").is_ok());
    }

    #[test]
    fn test_verify_rejects_any_tampering() {
        let env = envelope();
        let now = Utc::now().timestamp_millis();
        let sig = env.sign(b"payload", "req-1", now, "nonce-1");

        assert!(env.verify(b"payload2", &sig, "req-1", now, "nonce-1").is_err());
        assert!(env.verify(b"payload", &sig, "req-2", now, "nonce-1").is_err());
        assert!(env.verify(b"payload", &sig, "req-1", now + 1, "nonce-1").is_err());
        assert!(env.verify(b"payload", &sig, "req-1", now, "nonce-2").is_err());

        let mut flipped = sig.clone().into_bytes();
        flipped[0] = if flipped[0] == b'0' { b'1' } else { b'0' };
        let flipped = String::from_utf8(flipped).unwrap();
        assert!(env.verify(b"payload", &flipped, "req-1", now, "nonce-1").is_err());
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let env = envelope();
        let stale = Utc::now().timestamp_millis() - FRESHNESS_WINDOW_MS - 1_000;
        let sig = env.sign(b"payload", "req-1", stale, "nonce-1");
        assert!(matches!(
            env.verify(b"payload", &sig, "req-1", stale, "nonce-1"),
            Err(GuardError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_generated_headers_verify() {
        let env = envelope();
        let headers = env.generate_headers(b"the-body", "req-77");

        assert_eq!(headers.get("User-Agent").unwrap(), USER_AGENT);
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-77");
        // 16 random bytes, hex-encoded
        assert_eq!(headers.get(NONCE_HEADER).unwrap().len(), 32);

        let verified = env.validate_response(b"the-body", &headers, "req-77").unwrap();
        assert_eq!(verified.nonce, headers[NONCE_HEADER]);
    }

    #[test]
    fn test_validate_response_missing_headers() {
        let env = envelope();
        let mut headers = env.generate_headers(b"body", "req-1");
        headers.remove(NONCE_HEADER);

        let err = env.validate_response(b"body", &headers, "req-1").unwrap_err();
        assert!(matches!(err, GuardError::InvalidSignature(msg) if msg.contains("missing required security headers")));
    }

    #[test]
    fn test_validate_response_bad_timestamp_format() {
        let env = envelope();
        let mut headers = env.generate_headers(b"body", "req-1");
        headers.insert(TIMESTAMP_HEADER.to_string(), "not-a-number".to_string());

        let err = env.validate_response(b"body", &headers, "req-1").unwrap_err();
        assert!(matches!(err, GuardError::InvalidSignature(msg) if msg.contains("invalid timestamp format")));
    }

    #[test]
    fn test_validate_response_request_id_mismatch_before_signature() {
        let env = envelope();
        let headers = env.generate_headers(b"body", "req-1");
        // headers are valid for req-1; expecting req-2 must flag the id, not
        // the signature
        let err = env.validate_response(b"body", &headers, "req-2").unwrap_err();
        assert!(matches!(err, GuardError::RequestIdMismatch { .. }));
    }

    #[test]
    fn test_signature_substitution_resistance() {
        // Valid headers for (body1, id1) replayed onto (body2, id1) must
        // fail the signature check.
        let env = envelope();
        let headers = env.generate_headers(b"body-one", "req-1");
        let err = env.validate_response(b"body-two", &headers, "req-1").unwrap_err();
        assert!(matches!(err, GuardError::InvalidSignature(_)));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let env = envelope();
        let headers: HashMap<String, String> = env
            .generate_headers(b"body", "req-1")
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        assert!(env.validate_response(b"body", &headers, "req-1").is_ok());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let env = envelope();
        for value in [
            json!("sk-secret-api-key"),
            json!(42),
            json!({"token": "abc", "scopes": ["a", "b"]}),
            json!(null),
        ] {
            let encrypted = env.encrypt(&value).unwrap();
            assert_eq!(env.decrypt(&encrypted).unwrap(), value);
        }
    }

    #[test]
    fn test_encryptions_are_nondeterministic() {
        let env = envelope();
        let a = env.encrypt(&json!("same-value")).unwrap();
        let b = env.encrypt(&json!("same-value")).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted, b.encrypted);
    }

    #[test]
    fn test_decrypt_rejects_tampered_ciphertext() {
        let env = envelope();
        let mut encrypted = env.encrypt(&json!("secret")).unwrap();
        let mut raw = BASE64.decode(&encrypted.encrypted).unwrap();
        raw[0] ^= 0xff;
        encrypted.encrypted = BASE64.encode(&raw);
        assert!(matches!(
            env.decrypt(&encrypted),
            Err(GuardError::Encryption(msg)) if msg.contains("authentication failed")
        ));
    }

    #[test]
    fn test_iv_is_sixteen_bytes() {
        let env = envelope();
        let encrypted = env.encrypt(&json!("v")).unwrap();
        assert_eq!(BASE64.decode(&encrypted.iv).unwrap().len(), 16);
        assert_eq!(BASE64.decode(&encrypted.tag).unwrap().len(), 16);
    }

    #[test]
    fn test_encrypt_without_key_fails_cleanly() {
        let env = SecurityEnvelope::from_config(&WebhookSecurityConfig {
            signing_secret: "a-signing-secret-of-at-least-32-bytes!".to_string(),
            encryption_key: None,
            encrypt_sensitive_data: false,
            sensitive_fields: vec![],
        })
        .unwrap();
        assert!(env.encrypt(&json!("v")).is_err());
        assert!(env
            .decrypt(&EncryptedEnvelope {
                encrypted: String::new(),
                iv: String::new(),
                tag: String::new(),
            })
            .is_err());
    }

    #[test]
    fn test_sensitive_field_replacement_preserves_siblings() {
        let env = envelope();
        let mut payload = json!({
            "request": {
                "toolCall": {
                    "parameters": {
                        "apiKey": "sk-123",
                        "amount": 50,
                        "auth": {"token": "t-1", "user": "alice"}
                    }
                }
            }
        });

        env.encrypt_sensitive_fields(
            &mut payload,
            &[
                "request.toolCall.parameters.apiKey".to_string(),
                "request.toolCall.parameters.auth.token".to_string(),
                "request.toolCall.parameters.missing".to_string(),
            ],
        )
        .unwrap();

        let params = &payload["request"]["toolCall"]["parameters"];
        assert_eq!(params["amount"], json!(50));
        assert_eq!(params["auth"]["user"], json!("alice"));
        assert!(params["apiKey"].get("encrypted").is_some());
        assert!(params["auth"]["token"].get("iv").is_some());

        // round-trip the replaced leaf
        let envelope: EncryptedEnvelope =
            serde_json::from_value(params["apiKey"].clone()).unwrap();
        assert_eq!(env.decrypt(&envelope).unwrap(), json!("sk-123"));
    }

    #[test]
    fn test_nonce_cache_rejects_replay_and_sweeps() {
        let cache = NonceCache::new(Duration::from_millis(0));
        assert!(cache.insert("n1"));
        assert!(!cache.insert("n1"));
        assert!(cache.insert("n2"));
        assert_eq!(cache.len(), 2);

        // zero window: everything is immediately stale
        cache.sweep();
        assert!(cache.is_empty());
        assert!(cache.insert("n1"));
    }
}
