use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use layercache_core::{JobId, LayerId};

use crate::job::{JobFailure, Outcome};
use crate::registry::{LayerRegistry, Progress, RebuildError};

/// Runs one rebuild attempt: resolve the layer, then rebuild its cache.
///
/// Never panics and never returns an error; every failure is folded into
/// the [`Outcome`].
#[derive(Clone)]
pub struct Executor {
    registry: Arc<dyn LayerRegistry>,
}

impl Executor {
    pub fn new(registry: Arc<dyn LayerRegistry>) -> Self {
        Self { registry }
    }

    /// Run the attempt on the blocking pool and log its result.
    pub async fn run(&self, job_id: JobId, layer_id: LayerId, progress: Arc<dyn Progress>) -> Outcome {
        let started = Instant::now();
        let registry = Arc::clone(&self.registry);

        let joined =
            tokio::task::spawn_blocking(move || execute(registry.as_ref(), layer_id, progress.as_ref()))
                .await;

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let detail = panic_message(e.into_panic());
                Outcome::Failed(JobFailure::rebuild(&RebuildError::new(format!(
                    "rebuild panicked: {detail}"
                ))))
            }
            Err(_) => Outcome::Failed(JobFailure::rebuild(&RebuildError::new(
                "rebuild task was cancelled",
            ))),
        };

        log_attempt(job_id, layer_id, &outcome, started.elapsed());
        outcome
    }
}

fn execute(registry: &dyn LayerRegistry, layer_id: LayerId, progress: &dyn Progress) -> Outcome {
    let layer = match registry.resolve(layer_id) {
        Ok(layer) => layer,
        // Expected when the layer was removed after scheduling.
        Err(e) => return Outcome::Failed(JobFailure::resolution(&e)),
    };

    match layer.rebuild_cache(progress) {
        Ok(()) => Outcome::Succeeded,
        Err(e) => Outcome::Failed(JobFailure::rebuild(&e)),
    }
}

fn log_attempt(job_id: JobId, layer_id: LayerId, outcome: &Outcome, elapsed: Duration) {
    let duration_ms = elapsed.as_millis() as u64;
    match outcome.failure() {
        None => info!(
            %job_id,
            %layer_id,
            outcome = %outcome.state(),
            duration_ms,
            "rebuild attempt finished"
        ),
        Some(failure) => warn!(
            %job_id,
            %layer_id,
            outcome = %outcome.state(),
            failure = %failure.kind,
            error = %failure.detail,
            duration_ms,
            "rebuild attempt failed"
        ),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureKind;
    use crate::registry::{CacheLayer, MemoryRegistry, NoProgress};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        id: LayerId,
        calls: AtomicUsize,
        fail_with: Option<&'static str>,
    }

    impl CacheLayer for Counting {
        fn id(&self) -> LayerId {
            self.id
        }
        fn name(&self) -> &str {
            "counting"
        }
        fn rebuild_cache(&self, _progress: &dyn Progress) -> Result<(), RebuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(msg) => Err(RebuildError::new(msg)),
                None => Ok(()),
            }
        }
    }

    struct Panicking;

    impl CacheLayer for Panicking {
        fn id(&self) -> LayerId {
            LayerId::try_from(9).unwrap()
        }
        fn name(&self) -> &str {
            "panicking"
        }
        fn rebuild_cache(&self, _progress: &dyn Progress) -> Result<(), RebuildError> {
            panic!("index corrupted");
        }
    }

    fn layer(n: i64, fail_with: Option<&'static str>) -> Arc<Counting> {
        Arc::new(Counting {
            id: LayerId::try_from(n).unwrap(),
            calls: AtomicUsize::new(0),
            fail_with,
        })
    }

    async fn run(reg: Arc<MemoryRegistry>, n: i64) -> Outcome {
        Executor::new(reg)
            .run(JobId::new(), LayerId::try_from(n).unwrap(), Arc::new(NoProgress))
            .await
    }

    #[tokio::test]
    async fn successful_rebuild_succeeds() {
        let reg = Arc::new(MemoryRegistry::new());
        let l = layer(7, None);
        reg.insert(l.clone());
        assert_eq!(run(reg, 7).await, Outcome::Succeeded);
        assert_eq!(l.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_layer_fails_without_rebuild() {
        let reg = Arc::new(MemoryRegistry::new());
        let l = layer(7, None);
        reg.insert(l.clone());
        let outcome = run(reg, 8).await;
        assert_eq!(outcome.failure().unwrap().kind, FailureKind::LayerResolution);
        assert_eq!(l.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rebuild_error_detail_is_preserved() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.insert(layer(2, Some("disk full")));
        let outcome = run(reg, 2).await;
        let failure = outcome.failure().expect("should fail");
        assert_eq!(failure.kind, FailureKind::Rebuild);
        assert_eq!(failure.detail, "disk full");
    }

    #[tokio::test]
    async fn panic_becomes_rebuild_failure() {
        let reg = Arc::new(MemoryRegistry::new());
        reg.insert(Arc::new(Panicking));
        let outcome = run(reg, 9).await;
        let failure = outcome.failure().expect("should fail");
        assert_eq!(failure.kind, FailureKind::Rebuild);
        assert!(failure.detail.contains("index corrupted"));
    }
}
