//! Router middleware chain.
//!
//! Built-ins run in a fixed order on every dispatch:
//! 1. envelope schema check
//! 2. signature + replay verification (bypass for trusted in-process signers)
//! 3. payload size guard
//! 4. information-barrier scrubber for validator-bound messages
//!
//! The fifth stage - wrapping handler failures into `error` envelopes -
//! lives in the dispatch loop itself.

use tracing::warn;

use crate::envelope::{signing, KeyRegistry, ReplayGuard, SignedEnvelope};
use crate::types::{ComponentId, Error, Result};

/// Payload keys that must never reach the validator. Their presence on a
/// validator-bound envelope is a barrier violation (logged, then scrubbed).
pub const BARRIER_VIOLATING_KEYS: &[&str] = &[
    "userMessage",
    "conversationHistory",
    "journalData",
    "relevantMemories",
    "pluginCatalog",
    "originalMessage",
];

/// Context handed to each middleware stage.
pub struct MiddlewareContext<'a> {
    pub keys: &'a KeyRegistry,
    pub replay: &'a ReplayGuard,
    pub trusted_signers: &'a [ComponentId],
    pub max_message_size_bytes: usize,
    pub message_warning_threshold_bytes: usize,
}

impl std::fmt::Debug for MiddlewareContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareContext")
            .field("trusted_signers", &self.trusted_signers)
            .field("max_message_size_bytes", &self.max_message_size_bytes)
            .finish_non_exhaustive()
    }
}

/// One stage of the dispatch chain. Stages may mutate the envelope
/// (the scrubber does); a returned error aborts dispatch.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, envelope: &mut SignedEnvelope, ctx: &MiddlewareContext<'_>) -> Result<()>;
}

impl std::fmt::Debug for dyn Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Middleware({})", self.name())
    }
}

/// Stage 1: structural checks beyond what deserialization enforces.
#[derive(Debug)]
pub struct SchemaCheck;

impl Middleware for SchemaCheck {
    fn name(&self) -> &'static str {
        "schema-check"
    }

    fn apply(&self, envelope: &mut SignedEnvelope, _ctx: &MiddlewareContext<'_>) -> Result<()> {
        envelope.check_shape().map_err(Error::validation)?;
        if envelope.signature.is_empty() {
            return Err(Error::validation("envelope missing signature"));
        }
        Ok(())
    }
}

/// Stage 2: Ed25519 signature verification and replay protection.
///
/// Signers on the trusted list (in-process components sharing the router's
/// address space) skip both checks when so configured.
#[derive(Debug)]
pub struct VerifyAndReplay;

impl Middleware for VerifyAndReplay {
    fn name(&self) -> &'static str {
        "verify-replay"
    }

    fn apply(&self, envelope: &mut SignedEnvelope, ctx: &MiddlewareContext<'_>) -> Result<()> {
        if ctx.trusted_signers.contains(&envelope.signer) {
            return Ok(());
        }
        let key = ctx
            .keys
            .lookup(&envelope.signer)
            .ok_or_else(|| Error::auth(format!("no key registered for {}", envelope.signer)))?;
        signing::verify(envelope, &key)?;
        ctx.replay
            .check(envelope.message_id.as_str(), envelope.timestamp)
    }
}

/// Stage 3: payload size guard. Refuses above the hard cap, warns above
/// the soft threshold.
#[derive(Debug)]
pub struct SizeGuard;

impl Middleware for SizeGuard {
    fn name(&self) -> &'static str {
        "size-guard"
    }

    fn apply(&self, envelope: &mut SignedEnvelope, ctx: &MiddlewareContext<'_>) -> Result<()> {
        let size = envelope.payload_size();
        if size > ctx.max_message_size_bytes {
            return Err(Error::validation(format!(
                "payload size {} exceeds limit {}",
                size, ctx.max_message_size_bytes
            )));
        }
        if size > ctx.message_warning_threshold_bytes {
            warn!(
                message_id = %envelope.message_id,
                size,
                threshold = ctx.message_warning_threshold_bytes,
                "oversized message payload"
            );
        }
        Ok(())
    }
}

/// Stage 4: information-barrier scrubber.
///
/// For messages addressed to the validator, every payload key except
/// `plan` is removed before delivery. Known barrier-violating keys are
/// logged as violations; anything else is dropped silently.
#[derive(Debug)]
pub struct BarrierScrubber;

impl Middleware for BarrierScrubber {
    fn name(&self) -> &'static str {
        "barrier-scrubber"
    }

    fn apply(&self, envelope: &mut SignedEnvelope, _ctx: &MiddlewareContext<'_>) -> Result<()> {
        if !envelope.to.is_validator() {
            return Ok(());
        }
        let Some(object) = envelope.payload.as_object_mut() else {
            return Ok(());
        };

        let violations: Vec<String> = object
            .keys()
            .filter(|k| BARRIER_VIOLATING_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !violations.is_empty() {
            warn!(
                message_id = %envelope.message_id,
                from = %envelope.from,
                keys = ?violations,
                "information barrier violation: non-plan keys on validator-bound message"
            );
        }

        object.retain(|key, _| key == "plan");
        Ok(())
    }
}

/// The built-in chain, in dispatch order.
pub fn builtin_chain() -> Vec<Box<dyn Middleware>> {
    vec![
        Box::new(SchemaCheck),
        Box::new(VerifyAndReplay),
        Box::new(SizeGuard),
        Box::new(BarrierScrubber),
    ]
}
