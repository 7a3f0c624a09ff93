//! The job pipeline: plan types and the per-job state machine.

pub mod plan;
pub mod processor;

pub use plan::{ConditionOperator, ExecutionPlan, RiskLevel, Step, StepCondition};
pub use processor::PipelineProcessor;
