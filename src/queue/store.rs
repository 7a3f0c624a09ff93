//! The durable job store.
//!
//! All mutations are compare-and-set on the status column so only the
//! worker holding the lease can advance a job. The status fan-out fires
//! after each committed transition.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::queue::events::{JobStatusEvent, StatusFanout};
use crate::queue::{EnqueueRequest, Job, JobSource, JobStatus, Priority};
use crate::types::{
    now_ms, rfc3339_ms, ConversationId, Error, JobId, Result, RuntimeConfig, UserFacingError,
    WorkerId,
};

/// Error code for jobs whose lease recovery exhausted the attempt cap.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "MAX_ATTEMPTS_EXCEEDED";
/// Error code for approvals denied by the external inbox.
pub const APPROVAL_DENIED: &str = "APPROVAL_DENIED";
/// Error code for approvals that expired unanswered.
pub const APPROVAL_TIMEOUT: &str = "APPROVAL_TIMEOUT";

/// Durable priority queue over the `jobs` table.
#[derive(Debug)]
pub struct JobQueue {
    db: Database,
    fanout: StatusFanout,
    dedup_window_ms: u64,
    approval_nonce_ttl_hours: u32,
}

impl JobQueue {
    pub fn new(db: Database, config: &RuntimeConfig) -> Self {
        Self {
            db,
            fanout: StatusFanout::new(),
            dedup_window_ms: config.dedup_window_ms,
            approval_nonce_ttl_hours: config.approval_nonce_ttl_hours,
        }
    }

    /// Subscribe to post-commit status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.fanout.subscribe()
    }

    /// Insert a new pending job. With an idempotency key, an existing job
    /// enqueued under the same key within the dedup window is returned
    /// instead.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        if let Some(key) = &request.idempotency_key {
            let cutoff = rfc3339_ms(&(now_ms() - Duration::milliseconds(self.dedup_window_ms as i64)));
            let existing: Option<String> = self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT id FROM jobs WHERE idempotency_key = ?1 AND created_at >= ?2
                     ORDER BY created_at DESC LIMIT 1",
                    params![key, cutoff],
                    |row| row.get(0),
                )
                .optional()
            })?;
            if let Some(id) = existing {
                debug!(job_id = %id, key, "enqueue deduplicated");
                return self.get(&JobId::must(&id));
            }
        }

        let job = Job {
            id: JobId::new(),
            conversation_id: request
                .conversation_id
                .unwrap_or_default(),
            status: JobStatus::Pending,
            priority: request.priority,
            source: request.source,
            created_at: now_ms(),
            updated_at: now_ms(),
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
            plan: None,
            validation: None,
            result: None,
            error: None,
            metadata: request.metadata,
        };

        let metadata_json = match &job.metadata {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, conversation_id, status, priority, source_type,
                                   source_message_id, metadata_json, attempts, idempotency_key,
                                   created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10)",
                params![
                    job.id.as_str(),
                    job.conversation_id.as_str(),
                    job.status.as_str(),
                    job.priority.rank(),
                    job.source.as_str(),
                    request.source_message_id,
                    metadata_json,
                    request.idempotency_key,
                    rfc3339_ms(&job.created_at),
                    rfc3339_ms(&job.updated_at),
                ],
            )
        })?;
        info!(job_id = %job.id, priority = ?job.priority, "job enqueued");
        Ok(job)
    }

    pub fn get(&self, job_id: &JobId) -> Result<Job> {
        let job = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![job_id.as_str()],
                job_from_row,
            )
            .optional()
        })?;
        job.ok_or_else(|| Error::not_found(format!("job {} not found", job_id)))
    }

    /// Claim the best pending job: highest priority first, FIFO within a
    /// tier. Claiming transitions `pending → planning` and stamps the
    /// lease atomically; a lost race simply returns `None`.
    pub fn lease(&self, worker_id: &WorkerId, lease_ms: u64) -> Result<Option<Job>> {
        let candidate: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM jobs WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
        })?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let expires = rfc3339_ms(&(now_ms() + Duration::milliseconds(lease_ms as i64)));
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'planning', lease_owner = ?1,
                        lease_expires_at = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![worker_id.as_str(), expires, rfc3339_ms(&now_ms()), id],
            )
        })?;
        if changed == 0 {
            // Race lost to another worker.
            return Ok(None);
        }

        let job_id = JobId::must(&id);
        self.publish(&job_id, JobStatus::Pending, JobStatus::Planning);
        Ok(Some(self.get(&job_id)?))
    }

    /// Extend the lease; fails if this worker no longer owns the job.
    pub fn heartbeat(&self, job_id: &JobId, worker_id: &WorkerId, lease_ms: u64) -> Result<()> {
        let expires = rfc3339_ms(&(now_ms() + Duration::milliseconds(lease_ms as i64)));
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2 AND lease_owner = ?3",
                params![expires, job_id.as_str(), worker_id.as_str()],
            )
        })?;
        if changed == 0 {
            return Err(Error::conflict(format!(
                "worker {} does not hold the lease for {}",
                worker_id, job_id
            )));
        }
        Ok(())
    }

    /// Compare-and-set status transition. The lease is cleared whenever
    /// the target state is not worker-held.
    pub fn transition(&self, job_id: &JobId, from: JobStatus, to: JobStatus) -> Result<Job> {
        if !from.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "invalid transition {} -> {} for {}",
                from.as_str(),
                to.as_str(),
                job_id
            )));
        }
        let clear_lease = !to.is_leased();
        let changed = self.db.with_conn(|conn| {
            if clear_lease {
                conn.execute(
                    "UPDATE jobs SET status = ?1, lease_owner = NULL,
                            lease_expires_at = NULL, updated_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![
                        to.as_str(),
                        rfc3339_ms(&now_ms()),
                        job_id.as_str(),
                        from.as_str()
                    ],
                )
            } else {
                conn.execute(
                    "UPDATE jobs SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = ?4",
                    params![
                        to.as_str(),
                        rfc3339_ms(&now_ms()),
                        job_id.as_str(),
                        from.as_str()
                    ],
                )
            }
        })?;
        if changed == 0 {
            return Err(Error::conflict(format!(
                "job {} was not in {} (concurrent transition)",
                job_id,
                from.as_str()
            )));
        }
        self.publish(job_id, from, to);
        self.get(job_id)
    }

    /// Terminal success with the result payload persisted.
    pub fn complete(&self, job_id: &JobId, result: serde_json::Value) -> Result<Job> {
        let current = self.get(&job_id.clone())?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET result_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(&result).unwrap_or_default(), job_id.as_str()],
            )
        })?;
        self.transition(job_id, current.status, JobStatus::Completed)
    }

    /// Terminal failure with the user-visible error persisted.
    pub fn fail(&self, job_id: &JobId, error: UserFacingError) -> Result<Job> {
        let current = self.get(job_id)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET error_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(&error).unwrap_or_default(), job_id.as_str()],
            )
        })?;
        self.transition(job_id, current.status, JobStatus::Failed)
    }

    /// Cancel a job. Idempotent: terminal jobs are left untouched.
    pub fn cancel(&self, job_id: &JobId) -> Result<Job> {
        let current = self.get(job_id)?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        self.transition(job_id, current.status, JobStatus::Cancelled)
    }

    /// Persist the in-flight plan on the job row.
    pub fn set_plan(&self, job_id: &JobId, plan: &serde_json::Value) -> Result<()> {
        self.set_json_column(job_id, "plan_json", plan)
    }

    /// Persist the in-flight validation result on the job row.
    pub fn set_validation(&self, job_id: &JobId, validation: &serde_json::Value) -> Result<()> {
        self.set_json_column(job_id, "validation_json", validation)
    }

    fn set_json_column(
        &self,
        job_id: &JobId,
        column: &'static str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE jobs SET {} = ?1, updated_at = ?2 WHERE id = ?3", column),
                params![json, rfc3339_ms(&now_ms()), job_id.as_str()],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found(format!("job {} not found", job_id)));
        }
        Ok(())
    }

    /// Release the lease without changing status. Used when the pipeline
    /// suspends in `awaiting_approval`.
    pub fn release_lease(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_owner = ?2",
                params![job_id.as_str(), worker_id.as_str()],
            )
        })?;
        Ok(())
    }

    /// Re-acquire the lease on an unowned, non-terminal job (approval
    /// resume path).
    pub fn acquire_lease(&self, job_id: &JobId, worker_id: &WorkerId, lease_ms: u64) -> Result<()> {
        let expires = rfc3339_ms(&(now_ms() + Duration::milliseconds(lease_ms as i64)));
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET lease_owner = ?1, lease_expires_at = ?2
                 WHERE id = ?3 AND lease_owner IS NULL
                   AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![worker_id.as_str(), expires, job_id.as_str()],
            )
        })?;
        if changed == 0 {
            return Err(Error::conflict(format!(
                "could not acquire lease for {}",
                job_id
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Approvals
    // =========================================================================

    /// Move `validating → awaiting_approval` and mint the approval nonce
    /// the external inbox must present.
    pub fn begin_approval(&self, job_id: &JobId) -> Result<String> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET approval_nonce = ?1 WHERE id = ?2",
                params![nonce, job_id.as_str()],
            )
        })?;
        self.transition(job_id, JobStatus::Validating, JobStatus::AwaitingApproval)?;
        Ok(nonce)
    }

    /// The current approval nonce, for the approval inbox surface.
    pub fn approval_nonce(&self, job_id: &JobId) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT approval_nonce FROM jobs WHERE id = ?1",
                params![job_id.as_str()],
                |row| row.get(0),
            )
        })
    }

    /// External approval: `awaiting_approval → executing`, nonce-checked.
    pub fn approve(&self, job_id: &JobId, nonce: &str) -> Result<Job> {
        self.check_nonce(job_id, nonce)?;
        self.transition(job_id, JobStatus::AwaitingApproval, JobStatus::Executing)
    }

    /// External denial: `awaiting_approval → failed`, nonce-checked.
    pub fn deny(&self, job_id: &JobId, nonce: &str) -> Result<Job> {
        self.check_nonce(job_id, nonce)?;
        self.fail(
            job_id,
            UserFacingError::new(APPROVAL_DENIED, "approval denied by user"),
        )
    }

    fn check_nonce(&self, job_id: &JobId, nonce: &str) -> Result<()> {
        let job = self.get(job_id)?;
        if job.status != JobStatus::AwaitingApproval {
            return Err(Error::state_transition(format!(
                "job {} is not awaiting approval",
                job_id
            )));
        }
        let stored: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT approval_nonce FROM jobs WHERE id = ?1",
                params![job_id.as_str()],
                |row| row.get(0),
            )
        })?;
        let valid_until = job.updated_at + Duration::hours(self.approval_nonce_ttl_hours as i64);
        if now_ms() > valid_until {
            return Err(Error::auth(format!("approval nonce expired for {}", job_id)));
        }
        if stored.as_deref() != Some(nonce) {
            return Err(Error::auth(format!("invalid approval nonce for {}", job_id)));
        }
        Ok(())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reclaim jobs whose lease expired: back to `pending` with
    /// `attempts += 1`, or terminal `failed` once the cap is reached.
    pub fn recover_expired_leases(&self, max_attempts: u32) -> Result<Vec<JobId>> {
        let now = rfc3339_ms(&now_ms());
        let expired: Vec<(String, String, u32)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, attempts FROM jobs
                 WHERE status IN ('planning', 'validating', 'executing')
                   AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })?;

        let mut recovered = Vec::new();
        for (id, status, attempts) in expired {
            let job_id = JobId::must(&id);
            let Some(from) = JobStatus::parse(&status) else {
                continue;
            };
            let new_attempts = attempts + 1;
            if new_attempts >= max_attempts {
                warn!(job_id = %job_id, attempts = new_attempts, "attempt cap reached");
                self.db.with_conn(|conn| {
                    conn.execute(
                        "UPDATE jobs SET attempts = ?1 WHERE id = ?2",
                        params![new_attempts, id],
                    )
                })?;
                self.fail(
                    &job_id,
                    UserFacingError::new(MAX_ATTEMPTS_EXCEEDED, "job exceeded retry attempts"),
                )?;
            } else {
                let changed = self.db.with_conn(|conn| {
                    conn.execute(
                        "UPDATE jobs SET status = 'pending', attempts = ?1,
                                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?2
                         WHERE id = ?3 AND status = ?4",
                        params![new_attempts, rfc3339_ms(&now_ms()), id, status],
                    )
                })?;
                if changed > 0 {
                    self.publish(&job_id, from, JobStatus::Pending);
                }
            }
            recovered.push(job_id);
        }
        Ok(recovered)
    }

    /// Fail approval waits that outlived the job timeout.
    pub fn expire_stale_approvals(&self, job_timeout_ms: u64) -> Result<Vec<JobId>> {
        let cutoff = rfc3339_ms(&(now_ms() - Duration::milliseconds(job_timeout_ms as i64)));
        let stale: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM jobs
                 WHERE status = 'awaiting_approval' AND updated_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect()
        })?;

        let mut expired = Vec::new();
        for id in stale {
            let job_id = JobId::must(&id);
            self.fail(
                &job_id,
                UserFacingError::new(APPROVAL_TIMEOUT, "approval window expired"),
            )?;
            expired.push(job_id);
        }
        Ok(expired)
    }

    fn publish(&self, job_id: &JobId, from: JobStatus, to: JobStatus) {
        self.fanout.publish(JobStatusEvent {
            job_id: job_id.clone(),
            from,
            to,
            at: now_ms(),
        });
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let parse_time = |value: String| {
        DateTime::parse_from_rfc3339(&value)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    let status: String = row.get("status")?;
    let source: String = row.get("source_type")?;
    let priority: i64 = row.get("priority")?;

    let metadata: Option<String> = row.get("metadata_json")?;
    let plan: Option<String> = row.get("plan_json")?;
    let validation: Option<String> = row.get("validation_json")?;
    let result: Option<String> = row.get("result_json")?;
    let error: Option<String> = row.get("error_json")?;
    let lease_owner: Option<String> = row.get("lease_owner")?;
    let lease_expires: Option<String> = row.get("lease_expires_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let id: String = row.get("id")?;
    let conversation: String = row.get("conversation_id")?;

    Ok(Job {
        id: JobId::must(&id),
        conversation_id: ConversationId::must(&conversation),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        priority: Priority::from_rank(priority),
        source: JobSource::parse(&source).unwrap_or(JobSource::System),
        created_at: parse_time(created_at),
        updated_at: parse_time(updated_at),
        lease_owner: lease_owner.map(|w| WorkerId::must(&w)),
        lease_expires_at: lease_expires.map(parse_time),
        attempts: row.get("attempts")?,
        plan: plan.and_then(|p| serde_json::from_str(&p).ok()),
        validation: validation.and_then(|v| serde_json::from_str(&v).ok()),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: error.and_then(|e| serde_json::from_str(&e).ok()),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> JobQueue {
        let db = Database::open_in_memory().unwrap();
        JobQueue::new(db, &RuntimeConfig::default())
    }

    fn enqueue_one(queue: &JobQueue, priority: Priority) -> Job {
        queue
            .enqueue(EnqueueRequest {
                priority,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_enqueue_and_get() {
        let queue = queue();
        let job = enqueue_one(&queue, Priority::Normal);
        let fetched = queue.get(&job.id).unwrap();
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.attempts, 0);
        assert!(fetched.lease_owner.is_none());
    }

    #[test]
    fn test_lease_order_priority_then_fifo() {
        let queue = queue();
        let low = enqueue_one(&queue, Priority::Low);
        let high = enqueue_one(&queue, Priority::High);
        let normal = enqueue_one(&queue, Priority::Normal);

        let worker = WorkerId::must("w1");
        assert_eq!(queue.lease(&worker, 30_000).unwrap().unwrap().id, high.id);
        assert_eq!(queue.lease(&worker, 30_000).unwrap().unwrap().id, normal.id);
        assert_eq!(queue.lease(&worker, 30_000).unwrap().unwrap().id, low.id);
        assert!(queue.lease(&worker, 30_000).unwrap().is_none());
    }

    #[test]
    fn test_lease_sets_owner_and_status() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Planning);
        assert_eq!(job.lease_owner, Some(worker));
        assert!(job.lease_expires_at.is_some());
    }

    #[test]
    fn test_heartbeat_requires_ownership() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();

        assert!(queue.heartbeat(&job.id, &worker, 30_000).is_ok());
        assert!(queue
            .heartbeat(&job.id, &WorkerId::must("w2"), 30_000)
            .is_err());
    }

    #[test]
    fn test_transition_cas_rejects_stale_from() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();

        queue
            .transition(&job.id, JobStatus::Planning, JobStatus::Validating)
            .unwrap();
        // A second identical CAS loses.
        assert!(queue
            .transition(&job.id, JobStatus::Planning, JobStatus::Validating)
            .is_err());
    }

    #[test]
    fn test_invalid_transition_refused() {
        let queue = queue();
        let job = enqueue_one(&queue, Priority::Normal);
        assert!(queue
            .transition(&job.id, JobStatus::Pending, JobStatus::Executing)
            .is_err());
    }

    #[test]
    fn test_dedup_within_window() {
        let queue = queue();
        let first = queue
            .enqueue(EnqueueRequest {
                idempotency_key: Some("same-key".to_string()),
                ..Default::default()
            })
            .unwrap();
        let second = queue
            .enqueue(EnqueueRequest {
                idempotency_key: Some("same-key".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(first.id, second.id);

        let third = queue
            .enqueue(EnqueueRequest {
                idempotency_key: Some("other-key".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn test_complete_persists_result() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();

        let done = queue
            .complete(&job.id, serde_json::json!({"path": "fast", "text": "hi"}))
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap()["path"], "fast");
        assert!(done.lease_owner.is_none());
    }

    #[test]
    fn test_fail_persists_error() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();

        let failed = queue
            .fail(&job.id, UserFacingError::new("PLAN_REJECTED", "rejected"))
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.unwrap().code, "PLAN_REJECTED");
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let queue = queue();
        let job = enqueue_one(&queue, Priority::Normal);
        let cancelled = queue.cancel(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // Terminal state is never unwound.
        let again = queue.cancel(&job.id).unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_status_events_published() {
        let queue = queue();
        let mut rx = queue.subscribe();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.from, JobStatus::Pending);
        assert_eq!(event.to, JobStatus::Planning);
    }

    #[test]
    fn test_recovery_requeues_expired_lease() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        // Lease that expires immediately.
        let job = queue.lease(&worker, 0).unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let recovered = queue.recover_expired_leases(3).unwrap();
        assert_eq!(recovered, vec![job.id.clone()]);

        let job = queue.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn test_recovery_fails_job_at_attempt_cap() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");

        let mut job_id = None;
        for _ in 0..3 {
            if let Some(job) = queue.lease(&worker, 0).unwrap() {
                job_id = Some(job.id.clone());
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            queue.recover_expired_leases(3).unwrap();
        }

        let job = queue.get(&job_id.unwrap()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().code, MAX_ATTEMPTS_EXCEEDED);
    }

    #[test]
    fn test_approval_flow_with_nonce() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();
        queue
            .transition(&job.id, JobStatus::Planning, JobStatus::Validating)
            .unwrap();

        let nonce = queue.begin_approval(&job.id).unwrap();
        assert_eq!(
            queue.get(&job.id).unwrap().status,
            JobStatus::AwaitingApproval
        );

        // Wrong nonce refused.
        assert!(queue.approve(&job.id, "bogus").is_err());

        let approved = queue.approve(&job.id, &nonce).unwrap();
        assert_eq!(approved.status, JobStatus::Executing);
    }

    #[test]
    fn test_denial_fails_job() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();
        queue
            .transition(&job.id, JobStatus::Planning, JobStatus::Validating)
            .unwrap();
        let nonce = queue.begin_approval(&job.id).unwrap();

        let denied = queue.deny(&job.id, &nonce).unwrap();
        assert_eq!(denied.status, JobStatus::Failed);
        assert_eq!(denied.error.unwrap().code, APPROVAL_DENIED);
    }

    #[test]
    fn test_expire_stale_approvals() {
        let queue = queue();
        enqueue_one(&queue, Priority::Normal);
        let worker = WorkerId::must("w1");
        let job = queue.lease(&worker, 30_000).unwrap().unwrap();
        queue
            .transition(&job.id, JobStatus::Planning, JobStatus::Validating)
            .unwrap();
        queue.begin_approval(&job.id).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let expired = queue.expire_stale_approvals(1).unwrap();
        assert_eq!(expired, vec![job.id.clone()]);
        let job = queue.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().code, APPROVAL_TIMEOUT);
    }
}
