//! Worker pool.
//!
//! A bounded set of workers, each looping `lease → process → settle`.
//! Heartbeats extend the lease every third of its duration; a recovery
//! sweep re-queues jobs whose workers died. Stopping drains: leasing
//! halts immediately, in-flight jobs get the graceful window, then the
//! hard cancellation token fires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::PipelineProcessor;
use crate::queue::JobQueue;
use crate::types::{JobId, Result, RuntimeConfig, WorkerId};
use crate::watchdog::{MemoryPressureLevel, MemoryWatchdog};

pub mod recovery;

pub use recovery::{with_recovery, with_recovery_async};

/// Poll interval when the queue is empty or leases are refused.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Shared state the worker tasks run against.
struct WorkerCore {
    queue: Arc<JobQueue>,
    processor: Arc<PipelineProcessor>,
    watchdog: Option<Arc<MemoryWatchdog>>,
    config: Arc<RuntimeConfig>,
    /// Stops leasing; in-flight work continues.
    shutdown: CancellationToken,
    /// Cancels in-flight work after the drain window.
    hard_cancel: CancellationToken,
    in_flight: AtomicUsize,
}

/// The worker pool.
pub struct WorkerPool {
    core: Arc<WorkerCore>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.core.config.workers)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        processor: Arc<PipelineProcessor>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            core: Arc::new(WorkerCore {
                queue,
                processor,
                watchdog: None,
                config,
                shutdown: CancellationToken::new(),
                hard_cancel: CancellationToken::new(),
                in_flight: AtomicUsize::new(0),
            }),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_watchdog(self, watchdog: Arc<MemoryWatchdog>) -> Self {
        let core = self.core;
        // Not yet started: the core has a single owner here.
        let core = Arc::try_unwrap(core).map_or_else(
            |shared| {
                warn!("watchdog attached after start is ignored");
                shared
            },
            |mut owned| {
                owned.watchdog = Some(watchdog);
                Arc::new(owned)
            },
        );
        Self {
            core,
            handles: self.handles,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.core.in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the worker loops and the recovery sweep.
    pub fn start(&self) {
        let mut handles = match self.handles.lock() {
            Ok(handles) => handles,
            Err(_) => return,
        };
        if !handles.is_empty() {
            return; // Already started.
        }
        for index in 0..self.core.config.workers {
            let core = Arc::clone(&self.core);
            let worker_id = WorkerId::must(&format!("worker-{}", index));
            handles.push(tokio::spawn(async move {
                WorkerCore::worker_loop(&core, worker_id).await;
            }));
        }
        let core = Arc::clone(&self.core);
        handles.push(tokio::spawn(async move {
            WorkerCore::sweep_loop(&core).await;
        }));
        info!(workers = self.core.config.workers, "worker pool started");
    }

    /// Drain: stop leasing, wait for in-flight jobs up to the graceful
    /// window, then cancel whatever remains.
    pub async fn stop(&self) {
        self.core.shutdown.cancel();

        let deadline =
            tokio::time::Instant::now() + self.core.config.graceful_shutdown_timeout();
        while self.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.in_flight() > 0 {
            warn!(in_flight = self.in_flight(), "drain window expired; cancelling");
            self.core.hard_cancel.cancel();
        }

        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

impl WorkerCore {
    async fn worker_loop(this: &Arc<Self>, worker_id: WorkerId) {
        loop {
            if this.shutdown.is_cancelled() {
                return;
            }

            // Backpressure: no new leases under reject/emergency pressure.
            if this.pressure() >= MemoryPressureLevel::Reject {
                if this.idle_wait().await {
                    return;
                }
                continue;
            }

            let job = match this.queue.lease(&worker_id, this.config.lease_ms) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if this.idle_wait().await {
                        return;
                    }
                    continue;
                }
                Err(err) => {
                    warn!(worker = %worker_id, error = %err, "lease failed");
                    if this.idle_wait().await {
                        return;
                    }
                    continue;
                }
            };

            this.in_flight.fetch_add(1, Ordering::SeqCst);
            Self::run_job(this, &worker_id, job).await;
            this.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn run_job(this: &Arc<Self>, worker_id: &WorkerId, job: crate::queue::Job) {
        let job_id = job.id.clone();
        debug!(worker = %worker_id, job_id = %job_id, "job picked up");

        let job_cancel = this.hard_cancel.child_token();
        let heartbeat =
            Self::spawn_heartbeat(this, worker_id.clone(), job_id.clone(), job_cancel.clone());

        let processor = Arc::clone(&this.processor);
        let worker = worker_id.clone();
        let cancel = job_cancel.clone();
        let result = with_recovery_async(
            move || async move { processor.process(job, &worker, cancel).await },
            "pipeline.process",
        )
        .await;

        heartbeat.abort();
        if let Err(err) = result {
            warn!(job_id = %job_id, error = %err, "pipeline failed; recording");
            // The job may already be terminal; a failed fail is fine.
            let _ = this.queue.fail(&job_id, err.to_user_facing());
        }
    }

    /// Heartbeat every `leaseMs / 3`; also escalates emergency pressure
    /// into cancellation of this job.
    fn spawn_heartbeat(
        this: &Arc<Self>,
        worker_id: WorkerId,
        job_id: JobId,
        job_cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let core = Arc::clone(this);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.heartbeat_interval());
            ticker.tick().await; // First tick is immediate; skip it.
            loop {
                ticker.tick().await;
                if core.pressure() >= MemoryPressureLevel::Emergency {
                    warn!(job_id = %job_id, "emergency pressure; cancelling job");
                    job_cancel.cancel();
                }
                if core
                    .queue
                    .heartbeat(&job_id, &worker_id, core.config.lease_ms)
                    .is_err()
                {
                    // Lease lost or job finished; nothing left to extend.
                    return;
                }
            }
        })
    }

    /// Recovery sweep: expired leases and stale approvals. Paused at
    /// `pause` pressure and above.
    async fn sweep_loop(this: &Arc<Self>) {
        let interval = Duration::from_millis(this.config.lease_ms / 2);
        loop {
            tokio::select! {
                _ = this.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if this.pressure().pauses_background() {
                continue;
            }
            if let Err(err) = this.sweep_once() {
                warn!(error = %err, "recovery sweep failed");
            }
        }
    }

    fn sweep_once(&self) -> Result<()> {
        let recovered = self
            .queue
            .recover_expired_leases(self.config.max_step_attempts)?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered expired leases");
        }
        let expired = self
            .queue
            .expire_stale_approvals(self.config.job_timeout_ms)?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale approvals");
        }
        Ok(())
    }

    fn pressure(&self) -> MemoryPressureLevel {
        self.watchdog
            .as_ref()
            .map(|w| w.current())
            .unwrap_or(MemoryPressureLevel::Normal)
    }

    /// Returns true when shutdown fired during the wait.
    async fn idle_wait(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(IDLE_POLL) => false,
        }
    }
}
