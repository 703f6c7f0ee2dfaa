use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layercache_core::{JobId, LayerId};

use crate::job::{FailureKind, JobState, Outcome};

/// Observability record emitted once per executor attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub job_id: JobId,
    pub layer_id: LayerId,
    /// 1-based; above 1 only when a retry policy is in effect.
    pub attempt: u32,
    pub outcome: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn new(job_id: JobId, layer_id: LayerId, attempt: u32, outcome: &Outcome, duration_ms: u64) -> Self {
        let failure = outcome.failure();
        Self {
            job_id,
            layer_id,
            attempt,
            outcome: outcome.state(),
            failure: failure.map(|f| f.kind),
            error_detail: failure.map(|f| f.detail.clone()),
            timestamp: Utc::now(),
            duration_ms,
        }
    }
}

/// Listing entry for a job the scheduler still tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub layer_id: LayerId,
    pub state: JobState,
    pub accepted_at: DateTime<Utc>,
}
