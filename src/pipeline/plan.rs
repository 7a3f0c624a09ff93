//! Execution plans - the structured DAG of gear invocations.
//!
//! A plan is a flat array of steps; dependencies are step-id strings into
//! the same array, resolved to indices at DAG preflight. That keeps the
//! graph arena-shaped: no cyclic references, one topological pass.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::envelope::signing;
use crate::types::{Error, JobId, PlanId, Result};

/// Per-step risk classification, ordered from benign to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Comparison operators for step conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
    NotExists,
    In,
    NotIn,
}

/// A predicate over prior step results. `field` is
/// `<stepId>.<path>...`; numeric path segments index arrays, everything
/// else is a map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// One gear invocation inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within the plan.
    pub id: String,
    pub plugin: String,
    pub action: String,
    pub parameters: serde_json::Value,
    pub risk_level: RiskLevel,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
}

/// A planner-produced DAG of gear invocations for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: PlanId,
    pub job_id: JobId,
    pub steps: Vec<Step>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ExecutionPlan {
    /// Structural checks: unique step ids, no self-dependency, every
    /// dependency present. Cycle detection happens at DAG preflight.
    pub fn check_structure(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(Error::SelfDependency(step.id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(Error::UnknownStep(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Content hash over the canonical encoding. The pipeline uses this
    /// to avoid revalidating an unchanged plan.
    pub fn content_hash(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(signing::sha256_hex(signing::canonical_json(&value).as_bytes()))
    }

    /// The highest risk among all steps.
    pub fn max_risk(&self) -> RiskLevel {
        self.steps
            .iter()
            .map(|s| s.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low)
    }
}

/// Descend a dotted path into a JSON value. Numeric segments index
/// arrays; everything else is a map key. No coercion between the two.
pub fn descend_path<'a>(
    mut value: &'a serde_json::Value,
    segments: &[&str],
) -> Option<&'a serde_json::Value> {
    for segment in segments {
        match value {
            serde_json::Value::Object(map) => {
                value = map.get(*segment)?;
            }
            serde_json::Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                value = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Evaluate a condition against the map of prior step results.
///
/// The field's first segment names a step; the rest descend into its
/// result. A missing field satisfies only `not_exists`.
pub fn evaluate_condition(
    condition: &StepCondition,
    prior_results: &HashMap<String, serde_json::Value>,
) -> bool {
    let segments: Vec<&str> = condition.field.split('.').collect();
    let target = segments
        .first()
        .and_then(|step_id| prior_results.get(*step_id))
        .and_then(|result| descend_path(result, &segments[1..]));

    match condition.operator {
        ConditionOperator::Exists => target.is_some(),
        ConditionOperator::NotExists => target.is_none(),
        ConditionOperator::Eq => match (target, &condition.value) {
            (Some(actual), Some(expected)) => actual == expected,
            _ => false,
        },
        ConditionOperator::Ne => match (target, &condition.value) {
            (Some(actual), Some(expected)) => actual != expected,
            _ => false,
        },
        ConditionOperator::Gt | ConditionOperator::Gte | ConditionOperator::Lt
        | ConditionOperator::Lte => {
            let (Some(actual), Some(expected)) = (target, &condition.value) else {
                return false;
            };
            let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) else {
                return false;
            };
            match condition.operator {
                ConditionOperator::Gt => a > b,
                ConditionOperator::Gte => a >= b,
                ConditionOperator::Lt => a < b,
                _ => a <= b,
            }
        }
        ConditionOperator::In | ConditionOperator::NotIn => {
            let contained = match (target, &condition.value) {
                (Some(actual), Some(serde_json::Value::Array(items))) => items.contains(actual),
                _ => false,
            };
            if condition.operator == ConditionOperator::In {
                contained
            } else {
                !contained
            }
        }
    }
}
