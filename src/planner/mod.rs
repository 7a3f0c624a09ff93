//! Planner client (Scout).
//!
//! Scout turns a user message into either a direct textual reply (fast
//! path) or a structured execution plan (full path). It is polymorphic
//! over the LLM provider, enforces the job's token budget before calling
//! out, and self-checks fast-path replies for deferred-action language -
//! text claiming work was done that only the full path could have done
//! gets flagged for a reroute.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::costs::{CostTracker, LlmCall};
use crate::envelope::{EnvelopeSigner, MessageType, SignedEnvelope};
use crate::pipeline::plan::{ExecutionPlan, Step};
use crate::router::ComponentHandler;
use crate::types::{Error, JobId, PlanId, Result};

/// One message of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Request to the provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
}

/// One streamed chunk of provider output.
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The LLM provider seam. Concrete HTTP clients live outside the core.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<ChatChunk>>>;
    fn estimate_tokens(&self, text: &str) -> u64;
    fn max_context_tokens(&self) -> u64;
    fn name(&self) -> &str;
    fn model(&self) -> &str;
}

/// `plan.request` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequestPayload {
    pub user_message: String,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    #[serde(default)]
    pub cumulative_tokens: u64,
    pub job_id: JobId,
    /// Set on the iteration after a fast-path reroute.
    #[serde(default)]
    pub force_full_path: bool,
}

/// `plan.response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "path")]
pub enum PlanResponsePayload {
    #[serde(rename = "fast")]
    Fast {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(
            rename = "requiresReroute",
            default,
            skip_serializing_if = "std::ops::Not::not"
        )]
        requires_reroute: bool,
    },
    #[serde(rename = "full")]
    Full { plan: ExecutionPlan },
}

/// Phrases that mark a fast-path reply as claiming deferred actions.
const DEFERRED_ACTION_MARKERS: &[&str] = &[
    "i've gone ahead",
    "i have gone ahead",
    "i went ahead and",
    "i've created",
    "i've updated",
    "i've set up",
    "i've made the",
];

/// Shape the provider returns on the full path.
#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<Step>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// The planner component.
pub struct Scout {
    provider: Arc<dyn LlmProvider>,
    signer: EnvelopeSigner,
    costs: Option<Arc<CostTracker>>,
}

impl std::fmt::Debug for Scout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scout")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl Scout {
    pub fn new(provider: Arc<dyn LlmProvider>, signer: EnvelopeSigner) -> Self {
        Self {
            provider,
            signer,
            costs: None,
        }
    }

    pub fn with_cost_tracker(mut self, costs: Arc<CostTracker>) -> Self {
        self.costs = Some(costs);
        self
    }

    /// Produce a plan or a direct reply for one request.
    pub async fn plan(&self, request: &PlanRequestPayload) -> Result<PlanResponsePayload> {
        let prompt_tokens = self.provider.estimate_tokens(&request.user_message)
            + request
                .conversation_history
                .iter()
                .map(|m| self.provider.estimate_tokens(&m.content))
                .sum::<u64>();
        if request.cumulative_tokens + prompt_tokens > self.provider.max_context_tokens() {
            return Err(Error::budget_exceeded(format!(
                "job {} token budget exhausted ({} + {} over {})",
                request.job_id,
                request.cumulative_tokens,
                prompt_tokens,
                self.provider.max_context_tokens()
            )));
        }

        let mut messages = request.conversation_history.clone();
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user_message.clone(),
        });

        let started = Instant::now();
        let mut stream = self
            .provider
            .chat(ChatRequest {
                messages,
                max_tokens: None,
            })
            .await?;

        let mut text = String::new();
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            text.push_str(&chunk.content);
            input_tokens += chunk.input_tokens;
            output_tokens += chunk.output_tokens;
        }

        if let Some(costs) = &self.costs {
            if let Err(err) = costs.record_call(&LlmCall {
                job_id: Some(request.job_id.to_string()),
                component: "planner".to_string(),
                provider: self.provider.name().to_string(),
                model: self.provider.model().to_string(),
                input_tokens,
                output_tokens,
                cached_tokens: 0,
                duration_ms: started.elapsed().as_millis() as u64,
            }) {
                warn!(error = %err, "cost recording failed");
            }
        }

        // A JSON object with steps is a full-path plan.
        if let Some(raw) = parse_plan(&text) {
            let plan = ExecutionPlan {
                id: PlanId::new(),
                job_id: request.job_id.clone(),
                steps: raw.steps,
                reasoning: raw.reasoning,
            };
            plan.check_structure()?;
            debug!(job_id = %request.job_id, steps = plan.steps.len(), "full path plan");
            return Ok(PlanResponsePayload::Full { plan });
        }

        if request.force_full_path {
            // The reroute asked for a plan and the provider still answered
            // in prose; surface that rather than looping.
            return Err(Error::validation(
                "planner produced no plan on forced full path",
            ));
        }

        if claims_deferred_action(&text) {
            debug!(job_id = %request.job_id, "fast path self-check tripped; rerouting");
            return Ok(PlanResponsePayload::Fast {
                text: None,
                requires_reroute: true,
            });
        }

        Ok(PlanResponsePayload::Fast {
            text: Some(text),
            requires_reroute: false,
        })
    }
}

#[async_trait]
impl ComponentHandler for Scout {
    async fn handle(
        &self,
        envelope: SignedEnvelope,
        _cancel: CancellationToken,
    ) -> Result<SignedEnvelope> {
        if envelope.message_type != MessageType::PlanRequest {
            return Err(Error::validation(format!(
                "planner does not handle {}",
                envelope.message_type.as_str()
            )));
        }
        let request: PlanRequestPayload = serde_json::from_value(envelope.payload.clone())?;
        let response = self.plan(&request).await?;
        Ok(self.signer.sign_response(
            &envelope,
            MessageType::PlanResponse,
            serde_json::to_value(&response)?,
        ))
    }
}

fn parse_plan(text: &str) -> Option<RawPlan> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn claims_deferred_action(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    DEFERRED_ACTION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
