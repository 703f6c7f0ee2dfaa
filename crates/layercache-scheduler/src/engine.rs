use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use layercache_core::config::SchedulerSettings;
use layercache_core::{JobId, LayerId};

use crate::{
    constraint::{self, Conditions, ConstraintSet},
    error::{Result, SchedulerError},
    executor::Executor,
    handle::{JobCell, JobHandle, ProgressSink},
    job::{FailureKind, JobDescriptor, JobFailure, JobRequest, JobState, Outcome},
    record::{AttemptRecord, JobSummary},
    registry::{LayerRegistry, Progress},
    retry::RetryPolicy,
};

/// Defaults applied to requests that leave a field unset.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub initial_delay: Duration,
    /// Rebuilds allowed to execute at once, across all layers.
    pub max_concurrent_rebuilds: usize,
    /// `None` waits for constraints indefinitely.
    pub constraint_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(s: &SchedulerSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_concurrent_rebuilds: s.max_concurrent_rebuilds.max(1),
            constraint_timeout: s.constraint_timeout_ms.map(Duration::from_millis),
            retry: RetryPolicy::from(&s.retry),
        }
    }
}

/// Accepts rebuild requests and drives each one to a terminal state.
///
/// Every accepted job gets its own driver task. The driver sleeps through
/// the initial delay, waits for the job's constraints, queues for the
/// layer's slot (at most one running rebuild per layer) and a global
/// concurrency permit, then hands the job to the [`Executor`] exactly once.
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Executor,
    conditions: watch::Receiver<Conditions>,
    config: SchedulerConfig,
    /// Non-terminal jobs only. Drivers remove their entry when they finish.
    jobs: DashMap<JobId, Arc<JobCell>>,
    layer_slots: DashMap<LayerId, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
    /// If set, every executor attempt is reported here.
    records_tx: Option<mpsc::Sender<AttemptRecord>>,
    tracker: TaskTracker,
    runtime: Handle,
}

/// Held while a job runs: the layer's exclusive slot plus a global permit.
struct RunSlot {
    _layer: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl Scheduler {
    /// Create a scheduler bound to the current Tokio runtime.
    ///
    /// `records_tx` receives an [`AttemptRecord`] per executor attempt. The
    /// send is non-blocking (`try_send`); records are dropped with a warning
    /// when the channel is full.
    pub fn new(
        registry: Arc<dyn LayerRegistry>,
        conditions: watch::Receiver<Conditions>,
        config: SchedulerConfig,
        records_tx: Option<mpsc::Sender<AttemptRecord>>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent_rebuilds.max(1)));
        info!(
            max_concurrent = config.max_concurrent_rebuilds,
            initial_delay_ms = config.initial_delay.as_millis() as u64,
            "rebuild scheduler started"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                executor: Executor::new(registry),
                conditions,
                config,
                jobs: DashMap::new(),
                layer_slots: DashMap::new(),
                permits,
                records_tx,
                tracker: TaskTracker::new(),
                runtime,
            }),
        })
    }

    /// Schedule a cache rebuild for `layer_id`. Returns without waiting.
    pub fn schedule(
        &self,
        layer_id: i64,
        constraints: ConstraintSet,
        initial_delay: Duration,
    ) -> Result<JobHandle> {
        self.submit(
            JobRequest::new(layer_id)
                .constraints(constraints)
                .initial_delay(initial_delay),
        )
    }

    /// Validate `request`, register the job and spawn its driver.
    ///
    /// Callable from any thread; the driver runs on the scheduler's runtime.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        if self.inner.tracker.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }
        let layer_id = LayerId::try_from(request.layer_id)?;
        let config = &self.inner.config;
        let descriptor = JobDescriptor {
            id: JobId::new(),
            layer_id,
            constraints: request.constraints,
            initial_delay: request.initial_delay.unwrap_or(config.initial_delay),
            constraint_timeout: request.constraint_timeout.or(config.constraint_timeout),
            retry: request.retry.unwrap_or(config.retry),
            accepted_at: Utc::now(),
        };
        let job_id = descriptor.id;

        info!(
            %job_id,
            %layer_id,
            delay_ms = descriptor.initial_delay.as_millis() as u64,
            constraints = ?descriptor.constraints,
            "rebuild job accepted"
        );

        let cell = Arc::new(JobCell::new(descriptor));
        Inner::track(&self.inner, Arc::clone(&cell));
        Ok(JobHandle::new(cell))
    }

    /// Handle for a job that has not reached a terminal state yet.
    pub fn job(&self, id: JobId) -> Option<JobHandle> {
        self.inner
            .jobs
            .get(&id)
            .map(|cell| JobHandle::new(Arc::clone(cell.value())))
    }

    /// All tracked (non-terminal) jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self
            .inner
            .jobs
            .iter()
            .map(|entry| {
                let cell = entry.value();
                JobSummary {
                    job_id: cell.descriptor.id,
                    layer_id: cell.descriptor.layer_id,
                    state: cell.state(),
                    accepted_at: cell.descriptor.accepted_at,
                }
            })
            .collect();
        jobs.sort_by_key(|j| j.accepted_at);
        jobs
    }

    /// Cancel a job that has not started running.
    ///
    /// `Ok(false)` means the job is already running and will complete.
    pub fn cancel(&self, id: JobId) -> Result<bool> {
        let cell = self
            .inner
            .jobs
            .get(&id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        Ok(cell.cancel())
    }

    /// Cancel every job that is not running yet. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let cells: Vec<Arc<JobCell>> = self
            .inner
            .jobs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let cancelled = cells.iter().filter(|cell| cell.cancel()).count();
        if cancelled > 0 {
            info!(count = cancelled, "pending rebuild jobs cancelled");
        }
        cancelled
    }

    /// Stop accepting jobs, cancel the ones still waiting and wait for
    /// running rebuilds to finish.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.cancel_all();
        self.inner.tracker.wait().await;
        info!("rebuild scheduler stopped");
    }
}

impl Inner {
    /// Register `cell` and spawn its driver.
    ///
    /// A `shutdown` that closed the tracker after `submit` checked it has
    /// already run `cancel_all`, so the job is cancelled here instead.
    fn track(inner: &Arc<Inner>, cell: Arc<JobCell>) {
        let job_id = cell.descriptor.id;
        let layer_id = cell.descriptor.layer_id;
        inner.jobs.insert(job_id, Arc::clone(&cell));
        if inner.tracker.is_closed() && cell.cancel() {
            debug!(%job_id, "job accepted during shutdown, cancelled");
        }

        let driver = Arc::clone(inner);
        inner.tracker.spawn_on(
            async move {
                driver.drive(&cell).await;
                driver.jobs.remove(&job_id);
                driver.prune_slot(layer_id);
            },
            &inner.runtime,
        );
    }

    /// Walk one job from `Pending` to a terminal state.
    async fn drive(&self, cell: &Arc<JobCell>) {
        let d = &cell.descriptor;

        tokio::select! {
            biased;
            _ = cell.cancel_token.cancelled() => return log_cancelled(d),
            _ = tokio::time::sleep(d.initial_delay) => {}
        }
        if !cell.transition(JobState::Pending, JobState::Eligible) {
            return log_cancelled(d);
        }
        debug!(job_id = %d.id, layer_id = %d.layer_id, "rebuild job eligible");

        let deadline = d
            .constraint_timeout
            .map(|t| tokio::time::Instant::now() + t);
        let slot = tokio::select! {
            biased;
            _ = cell.cancel_token.cancelled() => return log_cancelled(d),
            slot = self.acquire_slot(d, deadline) => slot,
        };
        let slot = match slot {
            Ok(slot) => slot,
            Err(failure) => {
                warn!(job_id = %d.id, layer_id = %d.layer_id, error = %failure.detail, "rebuild job gave up waiting");
                cell.finish(JobState::Eligible, Outcome::Failed(failure));
                return;
            }
        };

        // Serialized with `cancel` through the job's state lock: exactly one wins.
        if !cell.transition(JobState::Eligible, JobState::Running) {
            return log_cancelled(d);
        }
        info!(job_id = %d.id, layer_id = %d.layer_id, "rebuild job dispatched");

        let outcome = self.execute(cell).await;
        // Terminal before the slot is released, so the next job queued on
        // this layer never overlaps a visibly running one.
        cell.finish(JobState::Running, outcome);
        drop(slot);
    }

    /// Wait for constraints, then take the layer slot and a permit.
    ///
    /// Constraints are re-checked once the slot is held, since a job may
    /// queue behind another rebuild of the same layer for a long time.
    async fn acquire_slot(
        &self,
        d: &JobDescriptor,
        deadline: Option<tokio::time::Instant>,
    ) -> std::result::Result<RunSlot, JobFailure> {
        let mut conditions = self.conditions.clone();
        loop {
            let wait = constraint::wait_until_satisfied(&mut conditions, &d.constraints);
            let waited = match deadline {
                Some(at) => tokio::time::timeout_at(at, wait).await.ok(),
                None => Some(wait.await),
            };
            match waited {
                Some(Ok(())) => {}
                Some(Err(_closed)) => {
                    return Err(JobFailure::constraints_unmet(
                        "host condition feed closed before constraints were met",
                    ))
                }
                None => {
                    let missing = d.constraints.missing(&conditions.borrow());
                    let waited_ms = d.constraint_timeout.unwrap_or_default().as_millis();
                    return Err(JobFailure::constraints_unmet(format!(
                        "constraints {missing:?} not met within {waited_ms}ms"
                    )));
                }
            }

            let layer_lock = self.layer_slot(d.layer_id);
            let layer = layer_lock.lock_owned().await;
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| JobFailure::constraints_unmet("rebuild permits closed"))?;

            if d.constraints.satisfied_by(&conditions.borrow()) {
                return Ok(RunSlot {
                    _layer: layer,
                    _permit: permit,
                });
            }
            debug!(job_id = %d.id, layer_id = %d.layer_id, "constraints lapsed while queued");
        }
    }

    /// Run the executor, re-attempting rebuild failures per the retry policy.
    async fn execute(&self, cell: &Arc<JobCell>) -> Outcome {
        let d = &cell.descriptor;
        let progress: Arc<dyn Progress> = Arc::new(ProgressSink(Arc::clone(cell)));
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let outcome = self
                .executor
                .run(d.id, d.layer_id, Arc::clone(&progress))
                .await;
            self.report(AttemptRecord::new(
                d.id,
                d.layer_id,
                attempt,
                &outcome,
                started.elapsed().as_millis() as u64,
            ));

            let retryable = matches!(outcome.failure(), Some(f) if f.kind == FailureKind::Rebuild);
            if !retryable || !d.retry.allows_retry_after(attempt) {
                return outcome;
            }
            warn!(
                job_id = %d.id,
                layer_id = %d.layer_id,
                attempt,
                backoff_ms = d.retry.backoff.as_millis() as u64,
                "rebuild failed, retrying"
            );
            tokio::time::sleep(d.retry.backoff).await;
            attempt += 1;
        }
    }

    fn report(&self, record: AttemptRecord) {
        if let Some(ref tx) = self.records_tx {
            let job_id = record.job_id;
            // try_send never blocks the driver; a lagging consumer loses records.
            if tx.try_send(record).is_err() {
                warn!(%job_id, "attempt record channel full or closed, record dropped");
            }
        }
    }

    fn layer_slot(&self, layer_id: LayerId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.layer_slots
                .entry(layer_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drop the layer's slot once no job holds or waits on it.
    fn prune_slot(&self, layer_id: LayerId) {
        self.layer_slots
            .remove_if(&layer_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

fn log_cancelled(d: &JobDescriptor) {
    info!(job_id = %d.id, layer_id = %d.layer_id, "rebuild job cancelled before dispatch");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn scheduler() -> Scheduler {
        let (_tx, rx) = watch::channel(Conditions::all_satisfied());
        Scheduler::new(
            Arc::new(MemoryRegistry::new()),
            rx,
            SchedulerConfig::default(),
            None,
        )
        .expect("scheduler")
    }

    #[test]
    fn new_outside_runtime_fails() {
        let (_tx, rx) = watch::channel(Conditions::all_satisfied());
        let result = Scheduler::new(
            Arc::new(MemoryRegistry::new()),
            rx,
            SchedulerConfig::default(),
            None,
        );
        assert!(matches!(result, Err(SchedulerError::NoRuntime)));
    }

    #[test]
    fn config_follows_settings() {
        let mut settings = SchedulerSettings::default();
        settings.constraint_timeout_ms = Some(1500);
        settings.retry.max_attempts = 3;
        let cfg = SchedulerConfig::from(&settings);
        assert_eq!(cfg.initial_delay, Duration::from_secs(1));
        assert_eq!(cfg.constraint_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn request_defaults_come_from_config() {
        let s = scheduler();
        let handle = s.submit(JobRequest::new(5)).expect("accepted");
        let d = handle.descriptor();
        assert_eq!(d.initial_delay, Duration::from_secs(1));
        assert_eq!(d.constraint_timeout, None);
        assert_eq!(d.retry, RetryPolicy::none());
        assert!(handle.cancel());
    }

    #[tokio::test]
    async fn negative_layer_id_is_rejected_synchronously() {
        let s = scheduler();
        let err = s
            .schedule(-1, ConstraintSet::new(), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
        assert!(s.jobs().is_empty());
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let s = scheduler();
        assert!(matches!(
            s.cancel(JobId::new()),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn job_registered_after_close_is_cancelled() {
        let s = scheduler();
        let cell = Arc::new(JobCell::new(JobDescriptor {
            id: JobId::new(),
            layer_id: LayerId::try_from(3).unwrap(),
            constraints: ConstraintSet::new(),
            initial_delay: Duration::from_secs(60),
            constraint_timeout: None,
            retry: RetryPolicy::none(),
            accepted_at: Utc::now(),
        }));
        // Shutdown already closed the tracker and ran cancel_all.
        s.inner.tracker.close();
        Inner::track(&s.inner, Arc::clone(&cell));

        assert_eq!(cell.state(), JobState::Cancelled);
        tokio::time::timeout(Duration::from_secs(1), s.inner.tracker.wait())
            .await
            .expect("driver exits without sleeping through the delay");
        assert!(s.jobs().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_and_refuses_new_jobs() {
        let s = scheduler();
        let handle = s
            .schedule(1, ConstraintSet::new(), Duration::from_secs(60))
            .expect("accepted");
        s.shutdown().await;
        assert_eq!(handle.outcome(), Some(Outcome::Cancelled));
        assert!(matches!(
            s.schedule(1, ConstraintSet::new(), Duration::ZERO),
            Err(SchedulerError::ShuttingDown)
        ));
    }
}
