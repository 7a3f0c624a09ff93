//! Job status-change fan-out.
//!
//! Single producer per job (the committing transition), broadcast to all
//! subscribers. Delivery happens synchronously after the transition
//! commits and never blocks it; handlers must be non-blocking.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::queue::JobStatus;
use crate::types::JobId;

/// Emitted after each committed status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusEvent {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

/// Broadcast channel wrapper; lagging subscribers drop old events rather
/// than stalling the producer.
#[derive(Debug)]
pub struct StatusFanout {
    sender: broadcast::Sender<JobStatusEvent>,
}

const FANOUT_CAPACITY: usize = 256;

impl StatusFanout {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FANOUT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.sender.subscribe()
    }

    /// Notify subscribers. A send with no receivers is not an error.
    pub fn publish(&self, event: JobStatusEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for StatusFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let fanout = StatusFanout::new();
        let mut rx1 = fanout.subscribe();
        let mut rx2 = fanout.subscribe();

        let event = JobStatusEvent {
            job_id: JobId::must("job_test"),
            from: JobStatus::Pending,
            to: JobStatus::Planning,
            at: Utc::now(),
        };
        fanout.publish(event.clone());

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let fanout = StatusFanout::new();
        fanout.publish(JobStatusEvent {
            job_id: JobId::new(),
            from: JobStatus::Planning,
            to: JobStatus::Completed,
            at: Utc::now(),
        });
    }
}
