//! `layercache-scheduler` — deferred, constraint-gated cache rebuilds.
//!
//! # Overview
//!
//! A caller asks the [`engine::Scheduler`] to rebuild the cache of one layer.
//! The request becomes an immutable [`job::JobDescriptor`] and a
//! [`handle::JobHandle`] is returned immediately. A background driver task
//! then walks the job through its lifecycle:
//!
//! | From       | Event                                  | To          |
//! |------------|----------------------------------------|-------------|
//! | `Pending`  | initial delay elapsed                  | `Eligible`  |
//! | `Eligible` | constraints hold, layer slot acquired  | `Running`   |
//! | `Eligible` | constraint wait timed out              | `Failed`    |
//! | `Running`  | layer resolved and rebuilt             | `Succeeded` |
//! | `Running`  | resolution or rebuild failed           | `Failed`    |
//! | `Pending`/`Eligible` | cancelled by the caller      | `Cancelled` |
//!
//! The layer registry and the rebuild itself live outside this crate and are
//! injected through the [`registry::LayerRegistry`] and
//! [`registry::CacheLayer`] traits.

pub mod constraint;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod job;
pub mod record;
pub mod registry;
pub mod retry;

pub use constraint::{Conditions, Constraint, ConstraintSet, HostConditions};
pub use engine::{Scheduler, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use executor::Executor;
pub use handle::JobHandle;
pub use job::{FailureKind, JobDescriptor, JobFailure, JobProgress, JobRequest, JobState, Outcome};
pub use layercache_core::{JobId, LayerId};
pub use record::{AttemptRecord, JobSummary};
pub use registry::{CacheLayer, LayerRegistry, MemoryRegistry, Progress, RebuildError, ResolveError};
pub use retry::RetryPolicy;
