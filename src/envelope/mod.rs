//! Signed envelopes - the unit of inter-component messaging.
//!
//! Every message on the router is a `SignedEnvelope`: addressed by
//! component id, correlated across request/response pairs, timestamped to
//! millisecond precision, and signed with Ed25519 over a canonical form.
//!
//! Submodules:
//! - `signing`: canonical JSON, sign/verify, the `EnvelopeSigner` identity
//! - `replay`: bounded seen-ids cache making verification idempotent
//! - `keys`: component-id to public-key registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ComponentId, CorrelationId, MessageId};

pub mod keys;
pub mod replay;
pub mod signing;

pub use keys::KeyRegistry;
pub use replay::ReplayGuard;
pub use signing::EnvelopeSigner;

/// Closed set of message types routed between components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "plan.request")]
    PlanRequest,
    #[serde(rename = "plan.response")]
    PlanResponse,
    #[serde(rename = "validate.request")]
    ValidateRequest,
    #[serde(rename = "validate.response")]
    ValidateResponse,
    #[serde(rename = "execute.request")]
    ExecuteRequest,
    #[serde(rename = "execute.response")]
    ExecuteResponse,
    #[serde(rename = "status.update")]
    StatusUpdate,
    #[serde(rename = "error")]
    Error,
}

impl MessageType {
    /// The wire name, as it appears in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::PlanRequest => "plan.request",
            MessageType::PlanResponse => "plan.response",
            MessageType::ValidateRequest => "validate.request",
            MessageType::ValidateResponse => "validate.response",
            MessageType::ExecuteRequest => "execute.request",
            MessageType::ExecuteResponse => "execute.response",
            MessageType::StatusUpdate => "status.update",
            MessageType::Error => "error",
        }
    }

    /// Whether this type answers a prior request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::PlanResponse
                | MessageType::ValidateResponse
                | MessageType::ExecuteResponse
                | MessageType::Error
        )
    }
}

/// A signed, addressed, correlated message.
///
/// The signature covers `{messageId, timestamp, signer, payload}` over the
/// canonical encoding in [`signing`]. `correlationId` is constant across a
/// request/response pair; `replyTo` equals the request's `messageId` on
/// responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,

    /// RFC-3339 with millisecond precision.
    pub timestamp: DateTime<Utc>,

    pub from: ComponentId,
    pub to: ComponentId,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    pub payload: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,

    /// Base64-encoded Ed25519 signature.
    pub signature: String,

    pub signer: ComponentId,
}

impl SignedEnvelope {
    /// Payload size in canonical-encoded bytes (what the size guard meters).
    pub fn payload_size(&self) -> usize {
        signing::canonical_json(&self.payload).len()
    }

    /// Structural checks independent of signature verification: required
    /// ids non-empty and response envelopes carrying `replyTo`.
    pub fn check_shape(&self) -> Result<(), String> {
        if self.message_type.is_response() && self.reply_to.is_none() {
            return Err(format!(
                "{} envelope missing replyTo",
                self.message_type.as_str()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;

    fn sample(message_type: MessageType, reply_to: Option<MessageId>) -> SignedEnvelope {
        SignedEnvelope {
            message_id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            reply_to,
            timestamp: now_ms(),
            from: ComponentId::queue(),
            to: ComponentId::planner(),
            message_type,
            payload: serde_json::json!({"k": "v"}),
            metadata: None,
            signature: String::new(),
            signer: ComponentId::queue(),
        }
    }

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(MessageType::PlanRequest.as_str(), "plan.request");
        assert_eq!(MessageType::Error.as_str(), "error");

        let json = serde_json::to_string(&MessageType::ValidateRequest).unwrap();
        assert_eq!(json, r#""validate.request""#);
    }

    #[test]
    fn test_unknown_message_type_refused() {
        let result: Result<MessageType, _> = serde_json::from_str(r#""plan.bogus""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_envelope_serde_roundtrip() {
        let env = sample(MessageType::PlanRequest, None);
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""type":"plan.request""#));
        let back: SignedEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn test_response_requires_reply_to() {
        let env = sample(MessageType::PlanResponse, None);
        assert!(env.check_shape().is_err());

        let env = sample(MessageType::PlanResponse, Some(MessageId::new()));
        assert!(env.check_shape().is_ok());
    }
}
