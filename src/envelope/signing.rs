//! Ed25519 envelope signing and verification.
//!
//! Canonical signing input: UTF-8 bytes of
//! `signer || "\n" || messageId || "\n" || timestamp || "\n" || canonicalJSON(payload)`
//! where canonical JSON sorts object keys lexicographically and uses no
//! insignificant whitespace. Hashing is SHA-256 throughout the crate.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::envelope::{MessageType, SignedEnvelope};
use crate::types::{
    now_ms, rfc3339_ms, ComponentId, CorrelationId, Error, MessageId, Result,
};

/// Canonical JSON encoding: object keys sorted, no insignificant whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key strings have no canonicalization concerns beyond JSON escaping.
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// The exact byte string the signature covers.
pub fn signing_input(
    signer: &ComponentId,
    message_id: &MessageId,
    timestamp: &chrono::DateTime<chrono::Utc>,
    payload: &serde_json::Value,
) -> Vec<u8> {
    let mut input = String::new();
    input.push_str(signer.as_str());
    input.push('\n');
    input.push_str(message_id.as_str());
    input.push('\n');
    input.push_str(&rfc3339_ms(timestamp));
    input.push('\n');
    input.push_str(&canonical_json(payload));
    input.into_bytes()
}

/// Verify an envelope's signature against the given public key.
pub fn verify(envelope: &SignedEnvelope, public_key: &VerifyingKey) -> Result<()> {
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&envelope.signature)
        .map_err(|e| Error::auth(format!("malformed signature encoding: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| Error::auth(format!("malformed signature: {}", e)))?;

    let input = signing_input(
        &envelope.signer,
        &envelope.message_id,
        &envelope.timestamp,
        &envelope.payload,
    );
    public_key
        .verify(&input, &signature)
        .map_err(|_| Error::auth("signature verification failed"))
}

/// SHA-256 of arbitrary bytes, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A signing identity bound to a component id.
///
/// The private key never leaves this struct; components hand their
/// verifying key to the [`super::KeyRegistry`] at registration time.
pub struct EnvelopeSigner {
    component: ComponentId,
    key: SigningKey,
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

impl EnvelopeSigner {
    /// Fresh random keypair for a component.
    pub fn generate(component: ComponentId) -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self { component, key }
    }

    pub fn from_key(component: ComponentId, key: SigningKey) -> Self {
        Self { component, key }
    }

    pub fn component(&self) -> &ComponentId {
        &self.component
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign a fresh request envelope.
    pub fn sign_request(
        &self,
        to: ComponentId,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> SignedEnvelope {
        self.build(to, message_type, payload, CorrelationId::new(), None)
    }

    /// Sign a response correlated to `request`.
    pub fn sign_response(
        &self,
        request: &SignedEnvelope,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> SignedEnvelope {
        self.build(
            request.from.clone(),
            message_type,
            payload,
            request.correlation_id.clone(),
            Some(request.message_id.clone()),
        )
    }

    /// Sign an `error`-type response with a `{code, message}` payload.
    pub fn sign_error(&self, request: &SignedEnvelope, code: &str, message: &str) -> SignedEnvelope {
        self.sign_response(
            request,
            MessageType::Error,
            serde_json::json!({"code": code, "message": message}),
        )
    }

    fn build(
        &self,
        to: ComponentId,
        message_type: MessageType,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
        reply_to: Option<MessageId>,
    ) -> SignedEnvelope {
        let message_id = MessageId::new();
        let timestamp = now_ms();
        let input = signing_input(&self.component, &message_id, &timestamp, &payload);
        let signature =
            base64::engine::general_purpose::STANDARD.encode(self.key.sign(&input).to_bytes());

        SignedEnvelope {
            message_id,
            correlation_id,
            reply_to,
            timestamp,
            from: self.component.clone(),
            to,
            message_type,
            payload,
            metadata: None,
            signature,
            signer: self.component.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_no_whitespace() {
        let value = json!({"list": [1, "two", null], "nested": {"x": 1.5}});
        let canonical = canonical_json(&value);
        assert!(!canonical.contains(' '));
        assert_eq!(canonical, r#"{"list":[1,"two",null],"nested":{"x":1.5}}"#);
    }

    #[test]
    fn test_sign_then_verify_roundtrip() {
        let signer = EnvelopeSigner::generate(ComponentId::planner());
        let env = signer.sign_request(
            ComponentId::validator(),
            MessageType::PlanRequest,
            json!({"jobId": "job_1"}),
        );
        assert!(verify(&env, &signer.verifying_key()).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let signer = EnvelopeSigner::generate(ComponentId::planner());
        let mut env = signer.sign_request(
            ComponentId::validator(),
            MessageType::PlanRequest,
            json!({"jobId": "job_1"}),
        );
        env.payload = json!({"jobId": "job_2"});
        assert!(verify(&env, &signer.verifying_key()).is_err());
    }

    #[test]
    fn test_tampered_signer_fails() {
        let signer = EnvelopeSigner::generate(ComponentId::planner());
        let mut env = signer.sign_request(
            ComponentId::validator(),
            MessageType::PlanRequest,
            json!({}),
        );
        env.signer = ComponentId::queue();
        assert!(verify(&env, &signer.verifying_key()).is_err());
    }

    #[test]
    fn test_tampered_message_id_fails() {
        let signer = EnvelopeSigner::generate(ComponentId::planner());
        let mut env = signer.sign_request(
            ComponentId::validator(),
            MessageType::PlanRequest,
            json!({}),
        );
        env.message_id = MessageId::new();
        assert!(verify(&env, &signer.verifying_key()).is_err());
    }

    #[test]
    fn test_tampered_timestamp_fails() {
        let signer = EnvelopeSigner::generate(ComponentId::planner());
        let mut env = signer.sign_request(
            ComponentId::validator(),
            MessageType::PlanRequest,
            json!({}),
        );
        env.timestamp = env.timestamp + chrono::Duration::milliseconds(1);
        assert!(verify(&env, &signer.verifying_key()).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = EnvelopeSigner::generate(ComponentId::planner());
        let other = EnvelopeSigner::generate(ComponentId::queue());
        let env = signer.sign_request(
            ComponentId::validator(),
            MessageType::PlanRequest,
            json!({}),
        );
        assert!(verify(&env, &other.verifying_key()).is_err());
    }

    #[test]
    fn test_response_correlation() {
        let requester = EnvelopeSigner::generate(ComponentId::queue());
        let responder = EnvelopeSigner::generate(ComponentId::planner());

        let request = requester.sign_request(
            ComponentId::planner(),
            MessageType::PlanRequest,
            json!({"userMessage": "hi"}),
        );
        let response =
            responder.sign_response(&request, MessageType::PlanResponse, json!({"path": "fast"}));

        assert_eq!(response.correlation_id, request.correlation_id);
        assert_eq!(response.reply_to, Some(request.message_id.clone()));
        assert_eq!(response.to, request.from);
        assert!(verify(&response, &responder.verifying_key()).is_ok());
    }

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_signature_survives_serde_roundtrip() {
        let signer = EnvelopeSigner::generate(ComponentId::sandbox_host());
        let env = signer.sign_request(
            ComponentId::queue(),
            MessageType::StatusUpdate,
            json!({"percent": 50, "nested": {"b": 2, "a": 1}}),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: SignedEnvelope = serde_json::from_str(&json).unwrap();
        assert!(verify(&back, &signer.verifying_key()).is_ok());
    }
}
