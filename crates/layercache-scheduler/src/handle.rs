use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use layercache_core::{JobId, LayerId};

use crate::job::{JobDescriptor, JobProgress, JobState, Outcome};
use crate::registry::Progress;

/// Observable state of one job.
#[derive(Debug, Clone)]
pub(crate) struct JobSnapshot {
    pub state: JobState,
    /// Set in the same update that moves the job to a terminal state.
    pub outcome: Option<Outcome>,
    pub progress: JobProgress,
}

/// Per-job state shared by the driver task, the scheduler and every handle.
///
/// All state changes go through the `watch` sender's lock, so concurrent
/// transitions (dispatch vs. cancel) are serialized per job.
pub(crate) struct JobCell {
    pub descriptor: JobDescriptor,
    snapshot: watch::Sender<JobSnapshot>,
    /// Wakes the driver when the job is cancelled.
    pub cancel_token: CancellationToken,
}

impl JobCell {
    pub fn new(descriptor: JobDescriptor) -> Self {
        let (snapshot, _rx) = watch::channel(JobSnapshot {
            state: JobState::Pending,
            outcome: None,
            progress: JobProgress::default(),
        });
        Self {
            descriptor,
            snapshot,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.snapshot.borrow().state
    }

    /// Compare-and-set `from -> to` for non-terminal targets.
    pub fn transition(&self, from: JobState, to: JobState) -> bool {
        debug_assert!(!to.is_terminal());
        self.snapshot.send_if_modified(|s| {
            if s.state != from || !from.can_transition_to(to) {
                return false;
            }
            s.state = to;
            true
        })
    }

    /// Move from `from` into the terminal state of `outcome`.
    pub fn finish(&self, from: JobState, outcome: Outcome) -> bool {
        let to = outcome.state();
        self.snapshot.send_if_modified(|s| {
            if s.state != from || !from.can_transition_to(to) {
                return false;
            }
            s.state = to;
            s.outcome = Some(outcome);
            true
        })
    }

    /// Cancel if the job has not started running yet.
    pub fn cancel(&self) -> bool {
        let cancelled = self.snapshot.send_if_modified(|s| {
            if !s.state.can_transition_to(JobState::Cancelled) {
                return false;
            }
            s.state = JobState::Cancelled;
            s.outcome = Some(Outcome::Cancelled);
            true
        });
        if cancelled {
            self.cancel_token.cancel();
        }
        cancelled
    }

    fn update_progress(&self, f: impl FnOnce(&mut JobProgress)) {
        self.snapshot.send_modify(|s| f(&mut s.progress));
    }
}

/// Forwards rebuild progress into the job's snapshot.
pub(crate) struct ProgressSink(pub Arc<JobCell>);

impl Progress for ProgressSink {
    fn set_max(&self, max: u64) {
        self.0.update_progress(|p| p.max = max);
    }

    fn set_value(&self, value: u64) {
        self.0.update_progress(|p| p.value = value);
    }

    fn set_message(&self, message: &str) {
        self.0.update_progress(|p| p.message = Some(message.to_string()));
    }
}

/// Caller-side view of an accepted job.
///
/// Cheap to clone; all clones observe the same job.
#[derive(Clone)]
pub struct JobHandle {
    cell: Arc<JobCell>,
}

impl JobHandle {
    pub(crate) fn new(cell: Arc<JobCell>) -> Self {
        Self { cell }
    }

    pub fn id(&self) -> JobId {
        self.cell.descriptor.id
    }

    pub fn layer_id(&self) -> LayerId {
        self.cell.descriptor.layer_id
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.cell.descriptor
    }

    pub fn state(&self) -> JobState {
        self.cell.state()
    }

    /// `Some` once the job reached a terminal state.
    pub fn outcome(&self) -> Option<Outcome> {
        self.cell.snapshot.borrow().outcome.clone()
    }

    pub fn progress(&self) -> JobProgress {
        self.cell.snapshot.borrow().progress.clone()
    }

    /// Cancel a job that is still `Pending` or `Eligible`.
    ///
    /// Returns `false` if it is already running or finished; a running
    /// rebuild always runs to completion.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.cell.snapshot.subscribe();
        // The sender lives in `self.cell`, so the channel cannot close here.
        let outcome = rx
            .wait_for(|s| s.outcome.is_some())
            .await
            .ok()
            .and_then(|snapshot| snapshot.outcome.clone());
        outcome
            .or_else(|| self.outcome())
            .unwrap_or(Outcome::Cancelled)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("layer_id", &self.layer_id())
            .field("state", &self.state())
            .finish()
    }
}
