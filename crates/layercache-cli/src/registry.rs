//! Layer registry backed by the `[[layers]]` config table.
//!
//! Each layer's cache is rebuilt by an external command, run through
//! `sh -c` with `LAYERCACHE_LAYER_ID` / `LAYERCACHE_LAYER_NAME` in its
//! environment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

use layercache_core::config::LayerConfig;
use layercache_scheduler::{CacheLayer, LayerId, LayerRegistry, Progress, RebuildError, ResolveError};

/// Keep this much of a failing command's stderr in the error detail.
const MAX_STDERR_CHARS: usize = 2_000;

pub struct ConfigRegistry {
    layers: HashMap<LayerId, Arc<CommandLayer>>,
}

impl ConfigRegistry {
    /// `runtime` drives the rebuild processes; rebuilds themselves are
    /// called from the blocking pool.
    pub fn new(layers: &[LayerConfig], runtime: Handle) -> Self {
        let layers = layers
            .iter()
            .map(|cfg| {
                let layer = CommandLayer {
                    config: cfg.clone(),
                    runtime: runtime.clone(),
                };
                (cfg.id, Arc::new(layer))
            })
            .collect();
        Self { layers }
    }
}

impl LayerRegistry for ConfigRegistry {
    fn resolve(&self, id: LayerId) -> Result<Arc<dyn CacheLayer>, ResolveError> {
        match self.layers.get(&id) {
            Some(layer) => Ok(Arc::clone(layer) as Arc<dyn CacheLayer>),
            None => Err(ResolveError::NotFound { id }),
        }
    }
}

pub struct CommandLayer {
    config: LayerConfig,
    runtime: Handle,
}

impl CacheLayer for CommandLayer {
    fn id(&self) -> LayerId {
        self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn rebuild_cache(&self, progress: &dyn Progress) -> Result<(), RebuildError> {
        let command = &self.config.rebuild_command;
        debug!(layer_id = %self.config.id, %command, "running rebuild command");
        progress.set_max(1);
        progress.set_message(&format!("rebuilding {}", self.config.name));

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("LAYERCACHE_LAYER_ID", self.config.id.to_string())
            .env("LAYERCACHE_LAYER_NAME", &self.config.name)
            .kill_on_drop(true);

        let timeout_secs = self.config.timeout_secs;
        let output = self.runtime.block_on(async move {
            let run = cmd.output();
            let result = match timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                    .await
                    .map_err(|_| {
                        RebuildError::new(format!("rebuild command timed out after {secs}s"))
                    })?,
                None => run.await,
            };
            result.map_err(|e| RebuildError::new(format!("failed to spawn rebuild command: {e}")))
        })?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RebuildError::new(format!(
                "rebuild command exited with {code}: {}",
                tail_chars(stderr.trim(), MAX_STDERR_CHARS)
            )));
        }

        progress.set_value(1);
        Ok(())
    }
}

/// Keep the last `max_chars` characters; errors are usually at the end.
fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }
    let tail: String = text.chars().skip(total - max_chars).collect();
    format!("[{} chars omitted] ...{tail}", total - max_chars)
}
