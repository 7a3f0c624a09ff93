//! DAG executor - layered parallel step execution.
//!
//! Preflight rejects self-dependencies, unknown dependencies, and cycles
//! (Kahn's algorithm) before any step runs. Execution then proceeds one
//! layer at a time: steps within a layer dispatch in parallel under a
//! bounded semaphore, and the next layer starts only after the current
//! one has fully settled. Step results are always reported in the
//! original input order.
//!
//! The executor never retries its own work; retry policy lives in the
//! step executor (sandbox attempts) and the queue (lease recovery).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipeline::plan::{self, Step, StepCondition};
use crate::types::{Error, JobId, Result};

/// Terminal status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Why a step was skipped; drives the overall-status rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    Condition,
    Failure,
    Breaker,
    Cancelled,
}

/// Per-step outcome, emitted in original plan order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_kind: Option<SkipKind>,
}

impl StepOutcome {
    fn skipped(step_id: &str, kind: SkipKind, reason: String) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            result: None,
            error: None,
            skip_reason: Some(reason),
            skip_kind: Some(kind),
        }
    }
}

/// Overall DAG status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DagStatus {
    Completed,
    Partial,
    Failed,
}

/// Result of one DAG execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagResult {
    pub status: DagStatus,
    pub step_results: Vec<StepOutcome>,
    pub duration_ms: u64,
}

/// Per-step progress event, tagged with the owning job.
#[derive(Debug, Clone, PartialEq)]
pub struct StepProgress {
    pub job_id: JobId,
    pub step_id: String,
    pub status: StepStatus,
}

/// Executes a single resolved step. Implementations receive the caller's
/// cancellation handle and own their retry policy.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute_step(
        &self,
        step: &Step,
        parameters: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value>;
}

/// Circuit breaker probe, owned by the sandbox host.
pub trait CircuitProbe: Send + Sync {
    fn is_open(&self, plugin: &str) -> bool;
}

/// Probe that never opens; useful for tests and non-gear executors.
#[derive(Debug, Default)]
pub struct NoCircuit;

impl CircuitProbe for NoCircuit {
    fn is_open(&self, _plugin: &str) -> bool {
        false
    }
}

type ConditionEval = fn(&StepCondition, &HashMap<String, serde_json::Value>) -> bool;

/// The layered DAG executor.
pub struct DagExecutor {
    max_concurrency: usize,
    breaker: Arc<dyn CircuitProbe>,
    condition_eval: ConditionEval,
}

impl std::fmt::Debug for DagExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagExecutor")
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl DagExecutor {
    pub fn new(max_concurrency: usize, breaker: Arc<dyn CircuitProbe>) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            breaker,
            condition_eval: plan::evaluate_condition,
        }
    }

    /// Override the condition evaluator (tests, alternative semantics).
    pub fn with_condition_eval(mut self, eval: ConditionEval) -> Self {
        self.condition_eval = eval;
        self
    }

    /// Execute a plan's steps. Preflight errors are fatal and arrive
    /// before any step runs; per-step failures are reported in the
    /// result, not as errors.
    pub async fn execute(
        &self,
        job_id: &JobId,
        steps: &[Step],
        executor: Arc<dyn StepExecutor>,
        cancel: CancellationToken,
        progress: Option<mpsc::UnboundedSender<StepProgress>>,
    ) -> Result<DagResult> {
        let started = Instant::now();
        let layers = preflight(steps)?;
        debug!(job_id = %job_id, layers = layers.len(), steps = steps.len(), "dag layered");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        // Completed results by step id, for $ref resolution and conditions.
        let mut results: HashMap<String, serde_json::Value> = HashMap::new();
        // step id -> originating failed ancestor id.
        let mut fail_root: HashMap<String, String> = HashMap::new();
        let mut outcomes: HashMap<String, StepOutcome> = HashMap::new();

        for layer in &layers {
            let mut handles = Vec::new();

            for &index in layer {
                let step = &steps[index];

                if cancel.is_cancelled() {
                    outcomes.insert(
                        step.id.clone(),
                        StepOutcome::skipped(&step.id, SkipKind::Cancelled, "Cancelled".into()),
                    );
                    continue;
                }

                // Failure propagation: any failed (or failure-skipped)
                // dependency skips this step, carrying the root cause id.
                if let Some(root) = failed_ancestor(step, &outcomes, &fail_root) {
                    fail_root.insert(step.id.clone(), root.clone());
                    outcomes.insert(
                        step.id.clone(),
                        StepOutcome::skipped(
                            &step.id,
                            SkipKind::Failure,
                            format!("Dependency failed: {}", root),
                        ),
                    );
                    continue;
                }

                if let Some(condition) = &step.condition {
                    if !(self.condition_eval)(condition, &results) {
                        outcomes.insert(
                            step.id.clone(),
                            StepOutcome::skipped(
                                &step.id,
                                SkipKind::Condition,
                                "Condition evaluated to false".into(),
                            ),
                        );
                        continue;
                    }
                }

                if self.breaker.is_open(&step.plugin) {
                    outcomes.insert(
                        step.id.clone(),
                        StepOutcome::skipped(
                            &step.id,
                            SkipKind::Breaker,
                            format!("Circuit breaker open for plugin: {}", step.plugin),
                        ),
                    );
                    continue;
                }

                let parameters = resolve_refs(&step.parameters, &results);
                let step = step.clone();
                let executor = Arc::clone(&executor);
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let step_started = Instant::now();
                    let outcome = executor.execute_step(&step, parameters, cancel).await;
                    (step.id.clone(), outcome, step_started.elapsed())
                }));
            }

            // The layer settles fully before the next one is entered.
            for handle in handles {
                let (step_id, outcome, elapsed) = match handle.await {
                    Ok(finished) => finished,
                    Err(join_err) => {
                        warn!(job_id = %job_id, error = %join_err, "step task aborted");
                        continue;
                    }
                };
                let duration_ms = elapsed.as_millis() as u64;
                let outcome = match outcome {
                    Ok(result) => {
                        results.insert(step_id.clone(), result.clone());
                        StepOutcome {
                            step_id: step_id.clone(),
                            status: StepStatus::Completed,
                            duration_ms,
                            result: Some(result),
                            error: None,
                            skip_reason: None,
                            skip_kind: None,
                        }
                    }
                    Err(err) => {
                        fail_root.insert(step_id.clone(), step_id.clone());
                        StepOutcome {
                            step_id: step_id.clone(),
                            status: StepStatus::Failed,
                            duration_ms,
                            result: None,
                            error: Some(err.to_string()),
                            skip_reason: None,
                            skip_kind: None,
                        }
                    }
                };
                if let Some(progress) = &progress {
                    let _ = progress.send(StepProgress {
                        job_id: job_id.clone(),
                        step_id: step_id.clone(),
                        status: outcome.status,
                    });
                }
                outcomes.insert(step_id, outcome);
            }
        }

        // Original input order, regardless of completion order.
        let step_results: Vec<StepOutcome> = steps
            .iter()
            .map(|step| {
                outcomes.remove(&step.id).unwrap_or_else(|| {
                    StepOutcome::skipped(&step.id, SkipKind::Cancelled, "Cancelled".into())
                })
            })
            .collect();

        Ok(DagResult {
            status: overall_status(&step_results),
            step_results,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// `completed` iff every step completed or was skipped by its condition;
/// `failed` iff every step failed or was skipped by failure/cancellation;
/// otherwise `partial`.
fn overall_status(step_results: &[StepOutcome]) -> DagStatus {
    let all_completed = step_results.iter().all(|r| {
        r.status == StepStatus::Completed || r.skip_kind == Some(SkipKind::Condition)
    });
    if all_completed {
        return DagStatus::Completed;
    }
    let all_failed = step_results.iter().all(|r| {
        r.status == StepStatus::Failed
            || matches!(r.skip_kind, Some(SkipKind::Failure) | Some(SkipKind::Cancelled))
    });
    if all_failed {
        return DagStatus::Failed;
    }
    DagStatus::Partial
}

fn failed_ancestor(
    step: &Step,
    outcomes: &HashMap<String, StepOutcome>,
    fail_root: &HashMap<String, String>,
) -> Option<String> {
    for dep in &step.depends_on {
        if let Some(outcome) = outcomes.get(dep) {
            if outcome.status == StepStatus::Failed {
                return Some(dep.clone());
            }
            if outcome.skip_kind == Some(SkipKind::Failure) {
                return fail_root.get(dep).cloned().or_else(|| Some(dep.clone()));
            }
        }
    }
    None
}

// =============================================================================
// Preflight
// =============================================================================

/// Validate structure and compute the topological layering.
///
/// Steps sharing a `parallelGroup` are hoisted into one layer (the latest
/// any member's dependencies demand) and dispatched as a batch.
fn preflight(steps: &[Step]) -> Result<Vec<Vec<usize>>> {
    let index_of: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    if index_of.len() != steps.len() {
        return Err(Error::validation("duplicate step ids in plan"));
    }

    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(Error::SelfDependency(step.id.clone()));
            }
            if !index_of.contains_key(dep.as_str()) {
                return Err(Error::UnknownStep(format!(
                    "step {} depends on unknown step {}",
                    step.id, dep
                )));
            }
        }
    }

    // Kahn's algorithm, level by level.
    let n = steps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let d = index_of[dep.as_str()];
            dependents[d].push(i);
            in_degree[i] += 1;
        }
    }

    let mut layer_of = vec![usize::MAX; n];
    let mut frontier: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0usize;
    let mut level = 0usize;
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &i in &frontier {
            layer_of[i] = level;
            processed += 1;
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        frontier = next;
        level += 1;
    }

    if processed < n {
        let mut unprocessed: Vec<&str> = (0..n)
            .filter(|&i| layer_of[i] == usize::MAX)
            .map(|i| steps[i].id.as_str())
            .collect();
        unprocessed.sort_unstable();
        return Err(Error::CycleDetected(unprocessed.join(", ")));
    }

    merge_parallel_groups(steps, &index_of, &mut layer_of);

    let max_layer = layer_of.iter().copied().max().unwrap_or(0);
    let mut layers: Vec<Vec<usize>> = vec![Vec::new(); max_layer + 1];
    for (i, &l) in layer_of.iter().enumerate() {
        layers[l].push(i);
    }
    layers.retain(|layer| !layer.is_empty());
    Ok(layers)
}

/// Pull every member of a parallel group into the same layer (the latest
/// one any member requires). Dependency order is re-enforced after each
/// merge; if the constraints cannot converge (a dependency edge inside a
/// group), dependency order wins and the group hint is dropped.
fn merge_parallel_groups(
    steps: &[Step],
    index_of: &HashMap<&str, usize>,
    layer_of: &mut [usize],
) {
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, step) in steps.iter().enumerate() {
        if let Some(group) = &step.parallel_group {
            groups.entry(group.as_str()).or_default().push(i);
        }
    }
    if groups.is_empty() {
        return;
    }

    let max_rounds = steps.len() + groups.len() + 1;
    for _ in 0..max_rounds {
        let mut changed = false;

        // Dependencies first: a step sits strictly below its dependents.
        for (i, step) in steps.iter().enumerate() {
            let floor = step
                .depends_on
                .iter()
                .map(|dep| layer_of[index_of[dep.as_str()]] + 1)
                .max()
                .unwrap_or(0);
            if layer_of[i] < floor {
                layer_of[i] = floor;
                changed = true;
            }
        }

        // Then group cohesion: all members land on the group's max layer.
        for members in groups.values() {
            let target = members.iter().map(|&i| layer_of[i]).max().unwrap_or(0);
            for &i in members {
                if layer_of[i] != target {
                    layer_of[i] = target;
                    changed = true;
                }
            }
        }

        if !changed {
            return;
        }
    }
    warn!("parallel group constraints did not converge; dependency order wins");
    // Recompute pure dependency layering.
    for _ in 0..steps.len() {
        for (i, step) in steps.iter().enumerate() {
            let floor = step
                .depends_on
                .iter()
                .map(|dep| layer_of[index_of[dep.as_str()]] + 1)
                .max()
                .unwrap_or(0);
            if layer_of[i] < floor {
                layer_of[i] = floor;
            }
        }
    }
}

// =============================================================================
// Reference resolution
// =============================================================================

const REF_PREFIX: &str = "$ref:step:";

/// Replace `$ref:step:<id>` strings (optionally with a dotted path) by
/// prior step results. Unresolvable references are left unchanged with a
/// warning; they never fail the step.
pub fn resolve_refs(
    value: &serde_json::Value,
    results: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s.starts_with(REF_PREFIX) => {
            let reference = &s[REF_PREFIX.len()..];
            let mut segments = reference.split('.');
            let step_id = segments.next().unwrap_or_default();
            let path: Vec<&str> = segments.collect();
            match results
                .get(step_id)
                .and_then(|result| plan::descend_path(result, &path))
            {
                Some(resolved) => resolved.clone(),
                None => {
                    warn!(reference = %s, "unresolvable step reference left unchanged");
                    value.clone()
                }
            }
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_refs(v, results)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| resolve_refs(v, results)).collect())
        }
        other => other.clone(),
    }
}

/// Set of step ids a result set marks as completed; test helper shared
/// with the pipeline module.
pub fn completed_ids(result: &DagResult) -> HashSet<&str> {
    result
        .step_results
        .iter()
        .filter(|r| r.status == StepStatus::Completed)
        .map(|r| r.step_id.as_str())
        .collect()
}
