//! Pipeline processor - the per-job state machine.
//!
//! Drives one leased job through planning, validation, approval, DAG
//! execution, and finalization. The processor owns no policy: the
//! planner and validator are addressed through the router, the DAG
//! executor runs the plan, and every status change goes through the
//! queue's compare-and-set transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{DagExecutor, DagStatus, StepExecutor, StepProgress};
use crate::envelope::{EnvelopeSigner, MessageType, SignedEnvelope};
use crate::pipeline::plan::ExecutionPlan;
use crate::planner::PlanResponsePayload;
use crate::queue::{Job, JobQueue, JobStatus};
use crate::router::Router;
use crate::types::{
    ComponentId, Error, JobId, Result, RuntimeConfig, UserFacingError, WorkerId,
};
use crate::validator::{ValidationResult, Verdict};

/// Job error code when the validator rejects the plan.
pub const PLAN_REJECTED: &str = "PLAN_REJECTED";
/// Job error code when revision cycles exceed the cap.
pub const MAX_REVISIONS_EXCEEDED: &str = "MAX_REVISIONS_EXCEEDED";
/// Job error code when fast-path reroutes exceed the cap.
pub const MAX_REPLANS_EXCEEDED: &str = "MAX_REPLANS_EXCEEDED";
/// Job error code when a revision produced a byte-identical plan.
pub const PLAN_UNCHANGED: &str = "PLAN_UNCHANGED";
/// Job error code when the DAG settles with every step failed.
pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";

/// The pipeline processor. One instance serves every worker; per-job
/// state lives on the stack of `process`.
pub struct PipelineProcessor {
    router: Arc<Router>,
    queue: Arc<JobQueue>,
    signer: EnvelopeSigner,
    dag: DagExecutor,
    step_executor: Arc<dyn StepExecutor>,
    config: Arc<RuntimeConfig>,
    progress: Option<mpsc::UnboundedSender<StepProgress>>,
}

impl std::fmt::Debug for PipelineProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineProcessor").finish_non_exhaustive()
    }
}

impl PipelineProcessor {
    pub fn new(
        router: Arc<Router>,
        queue: Arc<JobQueue>,
        signer: EnvelopeSigner,
        dag: DagExecutor,
        step_executor: Arc<dyn StepExecutor>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            router,
            queue,
            signer,
            dag,
            step_executor,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<StepProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Drive one job (already leased, status `planning`) to a terminal
    /// state. Errors returned here are the processor's own failures;
    /// job-level failures are persisted on the job and return `Ok`.
    pub async fn process(
        &self,
        job: Job,
        worker_id: &WorkerId,
        cancel: CancellationToken,
    ) -> Result<()> {
        let job_id = job.id.clone();
        let mut force_full_path = false;
        let mut revision_notes: Option<Vec<String>> = None;
        let mut revisions = 0u32;
        let mut replans = 0u32;
        let mut last_validated_hash: Option<String> = None;

        let plan: ExecutionPlan = loop {
            if cancel.is_cancelled() {
                self.queue.cancel(&job_id)?;
                return Ok(());
            }

            // ------------------------------------------------------------
            // Plan
            // ------------------------------------------------------------
            let response = match self
                .dispatch_planner(&job, force_full_path, revision_notes.take(), &cancel)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    self.queue.fail(&job_id, err.to_user_facing())?;
                    return Ok(());
                }
            };

            match response {
                PlanResponsePayload::Fast {
                    text,
                    requires_reroute: false,
                } => {
                    // Fast path: done.
                    self.queue.complete(
                        &job_id,
                        serde_json::json!({"path": "fast", "text": text}),
                    )?;
                    info!(job_id = %job_id, "fast path completed");
                    return Ok(());
                }
                PlanResponsePayload::Fast {
                    requires_reroute: true,
                    ..
                } => {
                    replans += 1;
                    if replans > self.config.max_replan_count {
                        self.queue.fail(
                            &job_id,
                            UserFacingError::new(
                                MAX_REPLANS_EXCEEDED,
                                "planner kept answering in prose",
                            ),
                        )?;
                        return Ok(());
                    }
                    debug!(job_id = %job_id, replans, "fast path rerouted to full path");
                    force_full_path = true;
                    continue;
                }
                PlanResponsePayload::Full { plan } => {
                    // --------------------------------------------------------
                    // Validate (full path only; the plan is the whole payload)
                    // --------------------------------------------------------
                    self.queue
                        .transition(&job_id, JobStatus::Planning, JobStatus::Validating)?;
                    self.queue.set_plan(&job_id, &serde_json::to_value(&plan)?)?;

                    let hash = plan.content_hash()?;
                    if last_validated_hash.as_deref() == Some(hash.as_str()) {
                        // The same plan is never revalidated unchanged.
                        self.queue.fail(
                            &job_id,
                            UserFacingError::new(
                                PLAN_UNCHANGED,
                                "revision produced an identical plan",
                            ),
                        )?;
                        return Ok(());
                    }
                    last_validated_hash = Some(hash);

                    let validation = match self.dispatch_validator(&plan, &cancel).await {
                        Ok(validation) => validation,
                        Err(err) => {
                            self.queue.fail(&job_id, err.to_user_facing())?;
                            return Ok(());
                        }
                    };
                    self.queue
                        .set_validation(&job_id, &serde_json::to_value(&validation)?)?;

                    match validation.verdict {
                        Verdict::Approved => {
                            self.queue.transition(
                                &job_id,
                                JobStatus::Validating,
                                JobStatus::Executing,
                            )?;
                            break plan;
                        }
                        Verdict::Rejected => {
                            self.queue.fail(
                                &job_id,
                                UserFacingError::new(PLAN_REJECTED, "plan rejected by validator"),
                            )?;
                            return Ok(());
                        }
                        Verdict::NeedsRevision => {
                            revisions += 1;
                            if revisions > self.config.max_revision_count {
                                self.queue.fail(
                                    &job_id,
                                    UserFacingError::new(
                                        MAX_REVISIONS_EXCEEDED,
                                        "validator kept requesting revisions",
                                    ),
                                )?;
                                return Ok(());
                            }
                            revision_notes = validation.policy_notes.clone();
                            self.queue.transition(
                                &job_id,
                                JobStatus::Validating,
                                JobStatus::Planning,
                            )?;
                            debug!(job_id = %job_id, revisions, "replanning per validator notes");
                            continue;
                        }
                        Verdict::NeedsUserApproval => {
                            // Trust mode only ever overrides this verdict.
                            if job.trust_mode() {
                                info!(job_id = %job_id, "trust mode auto-approved");
                                self.queue.transition(
                                    &job_id,
                                    JobStatus::Validating,
                                    JobStatus::Executing,
                                )?;
                                break plan;
                            }
                            if !self.await_approval(&job_id, worker_id, &cancel).await? {
                                return Ok(());
                            }
                            break plan;
                        }
                    }
                }
            }
        };

        // ------------------------------------------------------------
        // Execute + finalize
        // ------------------------------------------------------------
        let outcome = self
            .dag
            .execute(
                &job_id,
                &plan.steps,
                Arc::clone(&self.step_executor),
                cancel.clone(),
                self.progress.clone(),
            )
            .await;

        let dag_result = match outcome {
            Ok(result) => result,
            Err(err) => {
                // Preflight failures: no step ran.
                self.queue.fail(&job_id, err.to_user_facing())?;
                return Ok(());
            }
        };

        if cancel.is_cancelled() {
            self.queue.cancel(&job_id)?;
            return Ok(());
        }

        match dag_result.status {
            DagStatus::Completed | DagStatus::Partial => {
                // Partial settles as completed with per-step detail.
                self.queue.complete(
                    &job_id,
                    serde_json::json!({
                        "path": "full",
                        "status": dag_result.status,
                        "stepResults": dag_result.step_results,
                        "durationMs": dag_result.duration_ms,
                    }),
                )?;
            }
            DagStatus::Failed => {
                self.queue.fail(
                    &job_id,
                    UserFacingError::new(EXECUTION_FAILED, "every step failed or was skipped")
                        .with_cause(summarize_failures(&dag_result.step_results)),
                )?;
            }
        }
        Ok(())
    }

    async fn dispatch_planner(
        &self,
        job: &Job,
        force_full_path: bool,
        revision_notes: Option<Vec<String>>,
        cancel: &CancellationToken,
    ) -> Result<PlanResponsePayload> {
        let metadata = job.metadata.clone().unwrap_or_default();
        let payload = serde_json::json!({
            "userMessage": metadata
                .get("userMessage")
                .cloned()
                .unwrap_or_else(|| serde_json::json!("")),
            "conversationHistory": metadata
                .get("conversationHistory")
                .cloned()
                .unwrap_or_else(|| serde_json::json!([])),
            "cumulativeTokens": metadata
                .get("cumulativeTokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            "jobId": job.id.as_str(),
            "forceFullPath": force_full_path,
            "revisionNotes": revision_notes,
        });
        let request =
            self.signer
                .sign_request(ComponentId::planner(), MessageType::PlanRequest, payload);
        let response = self
            .dispatch(request, self.config.plan_timeout(), "planning", cancel)
            .await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    async fn dispatch_validator(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult> {
        // Only the plan crosses the information barrier. Nothing else is
        // ever put on this payload; the router scrubs as a second layer.
        let payload = serde_json::json!({"plan": serde_json::to_value(plan)?});
        let request = self.signer.sign_request(
            ComponentId::validator(),
            MessageType::ValidateRequest,
            payload,
        );
        let response = self
            .dispatch(request, self.config.validation_timeout(), "validation", cancel)
            .await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    /// Dispatch with deadline and correlation checks; error envelopes
    /// surface as errors carrying the remote code.
    async fn dispatch(
        &self,
        request: SignedEnvelope,
        timeout: Duration,
        phase: &str,
        cancel: &CancellationToken,
    ) -> Result<SignedEnvelope> {
        let response = tokio::time::timeout(
            timeout,
            self.router.dispatch(request.clone(), cancel.clone()),
        )
        .await
        .map_err(|_| Error::timeout(format!("{} timed out", phase)))?;

        if response.correlation_id != request.correlation_id
            || response.reply_to.as_ref() != Some(&request.message_id)
        {
            return Err(Error::internal(format!(
                "{} response correlation mismatch",
                phase
            )));
        }
        if response.message_type == MessageType::Error {
            let code = response.payload["code"].as_str().unwrap_or("INTERNAL_ERROR");
            let message = response.payload["message"]
                .as_str()
                .unwrap_or("unspecified error");
            // Budget failures keep their identity; everything else is
            // surfaced under the remote code.
            if code == "BUDGET_EXCEEDED" {
                return Err(Error::budget_exceeded(message));
            }
            return Err(Error::internal(format!("{}: {}", code, message)));
        }
        Ok(response)
    }

    /// Suspend in `awaiting_approval`. The lease is released; approval,
    /// denial, cancellation, or expiry arrive through the status channel.
    /// Returns `true` when approved and the lease re-acquired.
    async fn await_approval(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut events = self.queue.subscribe();
        // The nonce reaches the approval inbox out of band.
        let _nonce = self.queue.begin_approval(job_id)?;
        debug!(job_id = %job_id, "awaiting approval");

        let deadline = tokio::time::sleep(self.config.job_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Cancellation denies the pending approval.
                    self.queue.cancel(job_id)?;
                    return Ok(false);
                }
                _ = &mut deadline => {
                    warn!(job_id = %job_id, "approval window expired");
                    self.queue.fail(
                        job_id,
                        UserFacingError::new(
                            crate::queue::store::APPROVAL_TIMEOUT,
                            "approval window expired",
                        ),
                    )?;
                    return Ok(false);
                }
                event = events.recv() => {
                    let Ok(event) = event else {
                        // Lagged subscriber: re-check the row directly.
                        let job = self.queue.get(job_id)?;
                        match job.status {
                            JobStatus::Executing => {
                                self.queue.acquire_lease(job_id, worker_id, self.config.lease_ms)?;
                                return Ok(true);
                            }
                            status if status.is_terminal() => return Ok(false),
                            _ => { events = self.queue.subscribe(); continue; }
                        }
                    };
                    if event.job_id != *job_id {
                        continue;
                    }
                    match event.to {
                        JobStatus::Executing => {
                            self.queue.acquire_lease(job_id, worker_id, self.config.lease_ms)?;
                            info!(job_id = %job_id, "approval received");
                            return Ok(true);
                        }
                        JobStatus::Cancelled | JobStatus::Failed => return Ok(false),
                        _ => continue,
                    }
                }
            }
        }
    }
}

fn summarize_failures(step_results: &[crate::dag::StepOutcome]) -> String {
    step_results
        .iter()
        .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.step_id, e)))
        .collect::<Vec<_>>()
        .join("; ")
}
