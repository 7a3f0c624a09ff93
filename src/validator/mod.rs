//! Plan validator (Sentinel).
//!
//! The validator observes the plan and nothing else. Four enforcement
//! layers keep it that way: it registers only the `validate.request`
//! handler, the router scrubs every non-plan payload key before delivery,
//! envelope/plan/step metadata never influences verdicts, and the verdict
//! is a pure function of plan structure plus configured policy - the same
//! plan always yields the same result.
//!
//! Policy floors (standing rules can never lower them):
//! - critical-risk steps need user approval
//! - paths outside the workspace, or with `..` traversal, are rejected
//! - domains off the allowlist or in private ranges are rejected
//! - financial actions over the transaction ceiling are rejected;
//!   at or under it they need user approval
//! - shell actions need user approval regardless of caller

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::envelope::{EnvelopeSigner, MessageType, SignedEnvelope};
use crate::pipeline::plan::{ExecutionPlan, RiskLevel, Step};
use crate::router::ComponentHandler;
use crate::rules::{RuleVerdict, StandingRuleEngine};
use crate::types::{Error, Result};

pub mod policy;

pub use policy::{Policy, PolicyConfig};

/// Validation verdicts, ordered from benign to blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    NeedsUserApproval,
    NeedsRevision,
    Rejected,
}

impl Verdict {
    /// Severity rank; higher dominates when combining step verdicts.
    fn severity(self) -> u8 {
        match self {
            Verdict::Approved => 0,
            Verdict::NeedsUserApproval => 1,
            Verdict::NeedsRevision => 2,
            Verdict::Rejected => 3,
        }
    }

    fn max(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Per-step validation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepValidation {
    pub step_id: String,
    pub verdict: Verdict,
    pub risk_level: RiskLevel,
    pub reasons: Vec<String>,
}

/// The validator's reply, persisted on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub verdict: Verdict,
    pub overall_risk: RiskLevel,
    pub step_results: Vec<StepValidation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_notes: Option<Vec<String>>,
}

/// Parameter keys the financial floor reads the amount from.
const AMOUNT_KEYS: &[&str] = &["amount", "amountUsd", "total"];

/// Action/plugin substrings that mark a financial or transfer-like step.
const FINANCIAL_MARKERS: &[&str] = &[
    "charge", "payment", "pay", "transfer", "withdraw", "refund", "purchase",
];

/// The plan validator.
pub struct Sentinel {
    policy: Policy,
    rules: Arc<StandingRuleEngine>,
    signer: EnvelopeSigner,
}

impl std::fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sentinel").finish_non_exhaustive()
    }
}

impl Sentinel {
    pub fn new(policy: Policy, rules: Arc<StandingRuleEngine>, signer: EnvelopeSigner) -> Self {
        Self {
            policy,
            rules,
            signer,
        }
    }

    /// Derive the verdict from the plan alone. Pure in the policy sense:
    /// identical plans yield identical results regardless of context.
    pub fn validate_plan(&self, plan: &ExecutionPlan) -> ValidationResult {
        // Structural defects are fixable by replanning, not execution.
        if let Err(err) = plan.check_structure() {
            return ValidationResult {
                verdict: Verdict::NeedsRevision,
                overall_risk: plan.max_risk(),
                step_results: Vec::new(),
                policy_notes: Some(vec![format!("plan structure: {}", err)]),
            };
        }

        let mut notes = Vec::new();
        let step_results: Vec<StepValidation> = plan
            .steps
            .iter()
            .map(|step| self.validate_step(step, &mut notes))
            .collect();

        let verdict = step_results
            .iter()
            .fold(Verdict::Approved, |acc, s| acc.max(s.verdict));

        ValidationResult {
            verdict,
            overall_risk: plan.max_risk(),
            step_results,
            policy_notes: if notes.is_empty() { None } else { Some(notes) },
        }
    }

    fn validate_step(&self, step: &Step, notes: &mut Vec<String>) -> StepValidation {
        let mut verdict = Verdict::Approved;
        let mut reasons = Vec::new();
        // True once a hard floor fired; standing rules cannot lower those.
        let mut floored = false;

        if step.risk_level == RiskLevel::Critical {
            verdict = verdict.max(Verdict::NeedsUserApproval);
            floored = true;
            reasons.push("critical risk level requires user approval".to_string());
        }

        for path in collect_paths(&step.parameters) {
            if !self.policy.path_allowed(&path) {
                verdict = verdict.max(Verdict::Rejected);
                floored = true;
                reasons.push(format!("path {:?} escapes the workspace root", path));
            }
        }

        for host in collect_hosts(&step.parameters) {
            if !self.policy.domain_allowed(&host) {
                verdict = verdict.max(Verdict::Rejected);
                floored = true;
                reasons.push(format!("domain {:?} is not allowlisted", host));
            }
        }

        if is_financial(step) {
            let limit = self.policy.max_transaction_amount_usd();
            match transaction_amount(&step.parameters) {
                Some(amount) if amount > limit => {
                    verdict = verdict.max(Verdict::Rejected);
                    floored = true;
                    reasons.push(format!(
                        "transaction amount {} exceeds limit {}",
                        amount, limit
                    ));
                }
                _ => {
                    verdict = verdict.max(Verdict::NeedsUserApproval);
                    floored = true;
                    reasons.push("financial action requires user approval".to_string());
                }
            }
        }

        if is_shell(step) {
            verdict = verdict.max(Verdict::NeedsUserApproval);
            floored = true;
            reasons.push("shell action requires user approval".to_string());
        }

        // Soft policy: high risk asks for approval but standing rules may
        // upgrade it.
        if step.risk_level == RiskLevel::High && verdict == Verdict::Approved {
            verdict = Verdict::NeedsUserApproval;
            reasons.push("high risk level requires user approval".to_string());
        }

        // Standing rules: deny always hardens, approve only lifts
        // non-floor approval requests.
        let action = format!("{}:{}", step.plugin, step.action);
        match self.rules.match_rule(&action) {
            Ok(Some(rule)) => match rule.verdict {
                RuleVerdict::Deny => {
                    verdict = verdict.max(Verdict::Rejected);
                    reasons.push(format!("standing rule {} denies {}", rule.id, action));
                }
                RuleVerdict::Approve => {
                    if verdict == Verdict::NeedsUserApproval && !floored {
                        verdict = Verdict::Approved;
                        reasons.push(format!("standing rule {} approves {}", rule.id, action));
                    }
                }
            },
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "standing rule lookup failed; continuing without rules");
            }
        }

        if verdict == Verdict::NeedsUserApproval {
            if let Ok(true) = self.rules.suggest_rule(&action) {
                notes.push(format!(
                    "action {} has repeatedly required approval; consider a standing rule",
                    action
                ));
            }
        }

        StepValidation {
            step_id: step.id.clone(),
            verdict,
            risk_level: step.risk_level,
            reasons,
        }
    }
}

#[async_trait]
impl ComponentHandler for Sentinel {
    /// The validator answers `validate.request` and nothing else.
    async fn handle(
        &self,
        envelope: SignedEnvelope,
        _cancel: CancellationToken,
    ) -> Result<SignedEnvelope> {
        if envelope.message_type != MessageType::ValidateRequest {
            return Err(Error::validation(format!(
                "validator does not handle {}",
                envelope.message_type.as_str()
            )));
        }

        // After the router scrub, `plan` is the only key that can be here.
        // Envelope metadata is deliberately ignored.
        let plan_value = envelope
            .payload
            .get("plan")
            .cloned()
            .ok_or_else(|| Error::validation("validate.request payload missing plan"))?;
        let plan: ExecutionPlan = serde_json::from_value(plan_value)?;

        let result = self.validate_plan(&plan);
        debug!(plan_id = %plan.id, verdict = ?result.verdict, "plan validated");

        Ok(self.signer.sign_response(
            &envelope,
            MessageType::ValidateResponse,
            serde_json::to_value(&result)?,
        ))
    }
}

fn is_financial(step: &Step) -> bool {
    let action = step.action.to_ascii_lowercase();
    let plugin = step.plugin.to_ascii_lowercase();
    FINANCIAL_MARKERS
        .iter()
        .any(|marker| action.contains(marker) || plugin.contains(marker))
}

fn is_shell(step: &Step) -> bool {
    let action = step.action.to_ascii_lowercase();
    step.plugin.eq_ignore_ascii_case("shell")
        || action.contains("shell")
        || action.contains("command")
        || action == "exec"
}

fn transaction_amount(parameters: &serde_json::Value) -> Option<f64> {
    let object = parameters.as_object()?;
    AMOUNT_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(|v| v.as_f64()))
}

/// All string parameter values that look like filesystem paths.
fn collect_paths(parameters: &serde_json::Value) -> Vec<String> {
    let mut paths = Vec::new();
    walk_strings(parameters, &mut |s| {
        let looks_like_url = s.starts_with("http://") || s.starts_with("https://");
        if !looks_like_url && (s.starts_with('/') || s.contains("..") || s.contains('/')) {
            paths.push(s.to_string());
        }
    });
    paths
}

/// All hosts referenced by URL or domain-ish parameter values.
fn collect_hosts(parameters: &serde_json::Value) -> Vec<String> {
    let mut hosts = Vec::new();
    if let Some(object) = parameters.as_object() {
        for key in ["domain", "host"] {
            if let Some(host) = object.get(key).and_then(|v| v.as_str()) {
                hosts.push(host.to_string());
            }
        }
    }
    walk_strings(parameters, &mut |s| {
        if let Some(host) = policy::host_of_url(s) {
            hosts.push(host.to_string());
        }
    });
    hosts
}

fn walk_strings(value: &serde_json::Value, visit: &mut impl FnMut(&str)) {
    match value {
        serde_json::Value::String(s) => visit(s),
        serde_json::Value::Object(map) => {
            for child in map.values() {
                walk_strings(child, visit);
            }
        }
        serde_json::Value::Array(items) => {
            for child in items {
                walk_strings(child, visit);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::{ComponentId, JobId, PlanId};
    use serde_json::json;
    use std::path::PathBuf;

    fn sentinel() -> Sentinel {
        let policy = Policy::compile(PolicyConfig {
            workspace_root: PathBuf::from("/workspace"),
            allowed_domains: vec!["api.example.com".into()],
            max_transaction_amount_usd: 100.0,
        })
        .unwrap();
        let rules = Arc::new(StandingRuleEngine::new(
            Database::open_in_memory().unwrap(),
            5,
        ));
        Sentinel::new(policy, rules, EnvelopeSigner::generate(ComponentId::validator()))
    }

    fn one_step_plan(step: Step) -> ExecutionPlan {
        ExecutionPlan {
            id: PlanId::must("plan_test"),
            job_id: JobId::must("job_test"),
            steps: vec![step],
            reasoning: None,
        }
    }

    fn step(plugin: &str, action: &str, parameters: serde_json::Value, risk: RiskLevel) -> Step {
        Step {
            id: "s1".to_string(),
            plugin: plugin.to_string(),
            action: action.to_string(),
            parameters,
            risk_level: risk,
            depends_on: Vec::new(),
            parallel_group: None,
            condition: None,
        }
    }

    #[test]
    fn test_low_risk_read_approved() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "file-manager",
            "read_file",
            json!({"path": "/workspace/test.txt"}),
            RiskLevel::Low,
        ));
        let result = sentinel.validate_plan(&plan);
        assert_eq!(result.verdict, Verdict::Approved);
        assert_eq!(result.overall_risk, RiskLevel::Low);
        assert_eq!(result.step_results.len(), 1);
    }

    #[test]
    fn test_critical_risk_needs_approval() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "file-manager",
            "read_file",
            json!({"path": "/workspace/test.txt"}),
            RiskLevel::Critical,
        ));
        assert_eq!(
            sentinel.validate_plan(&plan).verdict,
            Verdict::NeedsUserApproval
        );
    }

    #[test]
    fn test_path_escape_rejected() {
        let sentinel = sentinel();
        for path in ["/etc/passwd", "/workspace/../etc/passwd"] {
            let plan = one_step_plan(step(
                "file-manager",
                "read_file",
                json!({"path": path}),
                RiskLevel::Low,
            ));
            assert_eq!(
                sentinel.validate_plan(&plan).verdict,
                Verdict::Rejected,
                "{} should be rejected",
                path
            );
        }
    }

    #[test]
    fn test_unlisted_domain_rejected() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "http-client",
            "get",
            json!({"url": "https://evil.com/data"}),
            RiskLevel::Low,
        ));
        assert_eq!(sentinel.validate_plan(&plan).verdict, Verdict::Rejected);

        let plan = one_step_plan(step(
            "http-client",
            "get",
            json!({"url": "https://api.example.com/data"}),
            RiskLevel::Low,
        ));
        assert_eq!(sentinel.validate_plan(&plan).verdict, Verdict::Approved);
    }

    #[test]
    fn test_private_range_rejected() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "http-client",
            "get",
            json!({"url": "http://192.168.1.10/admin"}),
            RiskLevel::Low,
        ));
        assert_eq!(sentinel.validate_plan(&plan).verdict, Verdict::Rejected);
    }

    #[test]
    fn test_over_limit_financial_rejected() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "payment",
            "charge",
            json!({"amount": 1000, "currency": "USD"}),
            RiskLevel::Critical,
        ));
        let result = sentinel.validate_plan(&plan);
        assert_eq!(result.verdict, Verdict::Rejected);
        assert_eq!(result.overall_risk, RiskLevel::Critical);
    }

    #[test]
    fn test_under_limit_financial_needs_approval() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "payment",
            "charge",
            json!({"amount": 25, "currency": "USD"}),
            RiskLevel::Medium,
        ));
        assert_eq!(
            sentinel.validate_plan(&plan).verdict,
            Verdict::NeedsUserApproval
        );
    }

    #[test]
    fn test_shell_needs_approval() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "shell",
            "run_command",
            json!({"cmd": "ls"}),
            RiskLevel::Low,
        ));
        assert_eq!(
            sentinel.validate_plan(&plan).verdict,
            Verdict::NeedsUserApproval
        );
    }

    #[test]
    fn test_standing_rule_upgrades_high_risk() {
        let sentinel = sentinel();
        let plan = one_step_plan(step(
            "file-manager",
            "delete_file",
            json!({"path": "/workspace/tmp.txt"}),
            RiskLevel::High,
        ));
        assert_eq!(
            sentinel.validate_plan(&plan).verdict,
            Verdict::NeedsUserApproval
        );

        sentinel
            .rules
            .create_rule(crate::rules::RuleSpec::approve(
                "file-manager:delete_file",
                "user",
            ))
            .unwrap();
        assert_eq!(sentinel.validate_plan(&plan).verdict, Verdict::Approved);
    }

    #[test]
    fn test_standing_rule_cannot_lower_floors() {
        let sentinel = sentinel();
        sentinel
            .rules
            .create_rule(crate::rules::RuleSpec::approve("shell:*", "user"))
            .unwrap();
        let plan = one_step_plan(step(
            "shell",
            "run_command",
            json!({"cmd": "ls"}),
            RiskLevel::Low,
        ));
        // Shell floor holds regardless of the approving rule.
        assert_eq!(
            sentinel.validate_plan(&plan).verdict,
            Verdict::NeedsUserApproval
        );
    }

    #[test]
    fn test_deny_rule_rejects() {
        let sentinel = sentinel();
        let mut spec = crate::rules::RuleSpec::approve("file-manager:read_file", "admin");
        spec.verdict = RuleVerdict::Deny;
        sentinel.rules.create_rule(spec).unwrap();

        let plan = one_step_plan(step(
            "file-manager",
            "read_file",
            json!({"path": "/workspace/test.txt"}),
            RiskLevel::Low,
        ));
        assert_eq!(sentinel.validate_plan(&plan).verdict, Verdict::Rejected);
    }

    #[test]
    fn test_broken_structure_needs_revision() {
        let sentinel = sentinel();
        let mut bad = step("file-manager", "read_file", json!({}), RiskLevel::Low);
        bad.depends_on = vec!["ghost".to_string()];
        let plan = one_step_plan(bad);
        let result = sentinel.validate_plan(&plan);
        assert_eq!(result.verdict, Verdict::NeedsRevision);
        assert!(result.policy_notes.is_some());
    }

    #[test]
    fn test_identical_plans_identical_verdicts() {
        let sentinel = sentinel();
        let make = || {
            one_step_plan(step(
                "file-manager",
                "read_file",
                json!({"path": "/workspace/test.txt"}),
                RiskLevel::Low,
            ))
        };
        let first = sentinel.validate_plan(&make());
        let second = sentinel.validate_plan(&make());
        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.overall_risk, second.overall_risk);
        assert_eq!(first.step_results, second.step_results);
    }

    #[tokio::test]
    async fn test_handler_refuses_other_types() {
        let sentinel = sentinel();
        let caller = EnvelopeSigner::generate(ComponentId::queue());
        let envelope = caller.sign_request(
            ComponentId::validator(),
            MessageType::PlanRequest,
            json!({}),
        );
        let result = sentinel.handle(envelope, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handler_validates_plan_payload() {
        let sentinel = sentinel();
        let caller = EnvelopeSigner::generate(ComponentId::queue());
        let plan = one_step_plan(step(
            "file-manager",
            "read_file",
            json!({"path": "/workspace/test.txt"}),
            RiskLevel::Low,
        ));
        let envelope = caller.sign_request(
            ComponentId::validator(),
            MessageType::ValidateRequest,
            json!({"plan": serde_json::to_value(&plan).unwrap()}),
        );
        let response = sentinel
            .handle(envelope, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.message_type, MessageType::ValidateResponse);
        assert_eq!(response.payload["verdict"], "approved");
    }
}
