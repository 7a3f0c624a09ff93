//! Durable priority job queue.
//!
//! Jobs live in the `jobs` table with an ordered index on
//! `(status, priority desc, created_at)`. Status transitions are
//! compare-and-set so concurrent workers cannot steal a claimed job;
//! terminal jobs are retained for audit, never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{ConversationId, JobId, UserFacingError, WorkerId};

pub mod events;
pub mod store;

pub use events::JobStatusEvent;
pub use store::JobQueue;

/// Job lifecycle states.
///
/// ```text
/// pending → planning → completed (fast path)
///                    → validating → failed | planning (revision)
///                                 → awaiting_approval → executing | failed
///                                 → executing → completed | failed
/// any non-terminal → cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Planning,
    Validating,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States in which a worker holds (or should hold) the lease.
    pub fn is_leased(self) -> bool {
        matches!(
            self,
            JobStatus::Planning | JobStatus::Validating | JobStatus::Executing
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            // Cancellation reaches every non-terminal state.
            (from, Cancelled) if !from.is_terminal() => true,
            (Pending, Planning) => true,
            // Fast path completes straight from planning.
            (Planning, Completed) => true,
            (Planning, Validating) => true,
            (Planning, Failed) => true,
            // Lease recovery re-queues in-flight work.
            (Planning, Pending) => true,
            (Validating, Executing) => true,
            (Validating, AwaitingApproval) => true,
            // needs_revision loops back to planning.
            (Validating, Planning) => true,
            (Validating, Failed) => true,
            (Validating, Pending) => true,
            (AwaitingApproval, Executing) => true,
            (AwaitingApproval, Failed) => true,
            (Executing, Completed) => true,
            (Executing, Failed) => true,
            (Executing, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Planning => "planning",
            JobStatus::Validating => "validating",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "planning" => Some(JobStatus::Planning),
            "validating" => Some(JobStatus::Validating),
            "awaiting_approval" => Some(JobStatus::AwaitingApproval),
            "executing" => Some(JobStatus::Executing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// Scheduling priority; higher leases first, FIFO within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Index ordering value: higher leases first.
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            2 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    User,
    Schedule,
    Plugin,
    System,
}

impl JobSource {
    pub fn as_str(self) -> &'static str {
        match self {
            JobSource::User => "user",
            JobSource::Schedule => "schedule",
            JobSource::Plugin => "plugin",
            JobSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(JobSource::User),
            "schedule" => Some(JobSource::Schedule),
            "plugin" => Some(JobSource::Plugin),
            "system" => Some(JobSource::System),
            _ => None,
        }
    }
}

/// A tracked user request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub conversation_id: ConversationId,
    pub status: JobStatus,
    pub priority: Priority,
    pub source: JobSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<WorkerId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UserFacingError>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Job {
    /// Trust mode lets the pipeline auto-approve `needs_user_approval`
    /// verdicts. It never overrides rejections or revision requests.
    pub fn trust_mode(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("trustMode"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Parameters for enqueueing a new job.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub conversation_id: Option<ConversationId>,
    pub priority: Priority,
    pub source: JobSource,
    pub source_message_id: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Jobs enqueued with the same key within the dedup window return
    /// the existing job.
    pub idempotency_key: Option<String>,
}

impl Default for JobSource {
    fn default() -> Self {
        JobSource::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn test_state_machine_paths() {
        use JobStatus::*;
        // Fast path.
        assert!(Pending.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Completed));
        // Full path.
        assert!(Planning.can_transition_to(Validating));
        assert!(Validating.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        // Revision loop.
        assert!(Validating.can_transition_to(Planning));
        // Cancellation from any non-terminal.
        assert!(Pending.can_transition_to(Cancelled));
        assert!(AwaitingApproval.can_transition_to(Cancelled));
        assert!(Executing.can_transition_to(Cancelled));
    }

    #[test]
    fn test_invalid_transitions() {
        use JobStatus::*;
        assert!(!Pending.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Executing));
        assert!(!AwaitingApproval.can_transition_to(Planning));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Planning,
            JobStatus::Validating,
            JobStatus::AwaitingApproval,
            JobStatus::Executing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High.rank() > Priority::Normal.rank());
        assert!(Priority::Normal.rank() > Priority::Low.rank());
        assert_eq!(Priority::from_rank(Priority::High.rank()), Priority::High);
    }

    #[test]
    fn test_trust_mode_flag() {
        let mut job = Job {
            id: JobId::new(),
            conversation_id: ConversationId::new(),
            status: JobStatus::Pending,
            priority: Priority::Normal,
            source: JobSource::User,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
            plan: None,
            validation: None,
            result: None,
            error: None,
            metadata: None,
        };
        assert!(!job.trust_mode());

        let mut metadata = HashMap::new();
        metadata.insert("trustMode".to_string(), serde_json::json!(true));
        job.metadata = Some(metadata);
        assert!(job.trust_mode());
    }
}
