use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layercache_core::{JobId, LayerId};

use crate::constraint::ConstraintSet;
use crate::registry::{RebuildError, ResolveError};
use crate::retry::RetryPolicy;

/// Lifecycle state of a rebuild job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted; waiting for the initial delay to elapse.
    Pending,
    /// Delay elapsed; waiting for constraints and a free layer slot.
    Eligible,
    /// Handed to the executor.
    Running,
    Succeeded,
    Failed,
    /// Cancelled by the caller before it started running.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// `Eligible -> Failed` only happens when a bounded constraint wait
    /// expires; every other failure comes out of `Running`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Eligible)
                | (Pending, Cancelled)
                | (Eligible, Running)
                | (Eligible, Cancelled)
                | (Eligible, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Eligible => "eligible",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "eligible" => Ok(JobState::Eligible),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The registry could not produce a rebuildable layer for the id.
    LayerResolution,
    /// The rebuild operation itself reported an error.
    Rebuild,
    /// Constraints never held within the configured timeout, or the host
    /// stopped publishing conditions.
    ConstraintsUnmet,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::LayerResolution => "layer_resolution",
            FailureKind::Rebuild => "rebuild",
            FailureKind::ConstraintsUnmet => "constraints_unmet",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    /// Original error text, preserved for diagnostics.
    pub detail: String,
}

impl JobFailure {
    pub fn resolution(err: &ResolveError) -> Self {
        Self {
            kind: FailureKind::LayerResolution,
            detail: err.to_string(),
        }
    }

    pub fn rebuild(err: &RebuildError) -> Self {
        Self {
            kind: FailureKind::Rebuild,
            detail: err.to_string(),
        }
    }

    pub fn constraints_unmet(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ConstraintsUnmet,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Terminal result of a job, observable through its handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed(JobFailure),
    Cancelled,
}

impl Outcome {
    /// The terminal state this outcome puts a job in.
    pub fn state(&self) -> JobState {
        match self {
            Outcome::Succeeded => JobState::Succeeded,
            Outcome::Failed(_) => JobState::Failed,
            Outcome::Cancelled => JobState::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            Outcome::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// Progress last reported by the rebuild operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub value: u64,
    pub max: u64,
    pub message: Option<String>,
}

/// Immutable record of one accepted rebuild request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub layer_id: LayerId,
    pub constraints: ConstraintSet,
    pub initial_delay: Duration,
    /// `None` waits for constraints indefinitely.
    pub constraint_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub accepted_at: DateTime<Utc>,
}

/// A schedule request before validation.
///
/// Unset fields fall back to the scheduler's configured defaults.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub layer_id: i64,
    pub constraints: ConstraintSet,
    pub initial_delay: Option<Duration>,
    pub constraint_timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl JobRequest {
    pub fn new(layer_id: i64) -> Self {
        Self {
            layer_id,
            constraints: ConstraintSet::default(),
            initial_delay: None,
            constraint_timeout: None,
            retry: None,
        }
    }

    pub fn constraints(mut self, constraints: ConstraintSet) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn constraint_timeout(mut self, timeout: Duration) -> Self {
        self.constraint_timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Eligible,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn nothing_reenters_pending() {
        for from in ALL {
            assert!(!from.can_transition_to(JobState::Pending));
        }
    }

    #[test]
    fn running_cannot_be_cancelled() {
        assert!(!JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(JobState::Eligible.can_transition_to(JobState::Cancelled));
        assert!(JobState::Pending.can_transition_to(JobState::Cancelled));
    }

    #[test]
    fn pending_cannot_skip_to_running() {
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
    }

    #[test]
    fn state_text_roundtrip() {
        for s in ALL {
            assert_eq!(s.to_string().parse::<JobState>().unwrap(), s);
        }
        assert!("done".parse::<JobState>().is_err());
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        assert_eq!(Outcome::Succeeded.state(), JobState::Succeeded);
        assert_eq!(Outcome::Cancelled.state(), JobState::Cancelled);
        let failed = Outcome::Failed(JobFailure::constraints_unmet("timed out"));
        assert_eq!(failed.state(), JobState::Failed);
        assert_eq!(failed.failure().unwrap().kind, FailureKind::ConstraintsUnmet);
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_string(&Outcome::Succeeded).unwrap();
        assert_eq!(json, r#"{"outcome":"succeeded"}"#);
    }
}
