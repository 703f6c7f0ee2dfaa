use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::LayerId;

/// The host worker always deferred rebuilds by one second.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_CONCURRENT_REBUILDS: usize = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5_000;
pub const ENV_PREFIX: &str = "LAYERCACHE_";

/// Top-level config (layercache.toml + LAYERCACHE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayercacheConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub conditions: ConditionsConfig,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
}

/// Scheduling defaults applied to requests that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on rebuilds executing at the same time, across all layers.
    #[serde(default = "default_max_concurrent_rebuilds")]
    pub max_concurrent_rebuilds: usize,
    /// Give up waiting for constraints after this long. `None` waits forever.
    #[serde(default)]
    pub constraint_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_concurrent_rebuilds: DEFAULT_MAX_CONCURRENT_REBUILDS,
            constraint_timeout_ms: None,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first one. 1 disables retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Initial host condition snapshot. A standalone host has no platform
/// signals, so everything defaults to satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionsConfig {
    #[serde(default = "bool_true")]
    pub network: bool,
    #[serde(default = "bool_true")]
    pub device_idle: bool,
    #[serde(default = "bool_true")]
    pub charging: bool,
    #[serde(default = "bool_true")]
    pub battery_not_low: bool,
    #[serde(default = "bool_true")]
    pub storage_not_low: bool,
}

impl Default for ConditionsConfig {
    fn default() -> Self {
        Self {
            network: true,
            device_idle: true,
            charging: true,
            battery_not_low: true,
            storage_not_low: true,
        }
    }
}

/// A layer the CLI host can resolve; its cache is rebuilt by running
/// `rebuild_command` through `sh -c`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub id: LayerId,
    pub name: String,
    pub rebuild_command: String,
    /// Kill the rebuild command after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn bool_true() -> bool {
    true
}
fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_DELAY_MS
}
fn default_max_concurrent_rebuilds() -> usize {
    DEFAULT_MAX_CONCURRENT_REBUILDS
}
fn default_max_attempts() -> u32 {
    1
}
fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

impl LayercacheConfig {
    /// Load config from a TOML file with LAYERCACHE_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `LAYERCACHE_CONFIG`, then
    /// `~/.layercache/layercache.toml`. Nested keys use `__` in env names,
    /// e.g. `LAYERCACHE_SCHEDULER__INITIAL_DELAY_MS=250`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("LAYERCACHE_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        let config: LayercacheConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| crate::error::LayercacheError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configs the scheduler cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::LayercacheError::Config;

        if self.scheduler.max_concurrent_rebuilds == 0 {
            return Err(Config("scheduler.max_concurrent_rebuilds must be at least 1".into()));
        }
        if self.scheduler.retry.max_attempts == 0 {
            return Err(Config("scheduler.retry.max_attempts must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.id) {
                return Err(Config(format!("duplicate layer id {}", layer.id)));
            }
        }
        Ok(())
    }

    pub fn layer(&self, id: LayerId) -> Option<&LayerConfig> {
        self.layers.iter().find(|l| l.id == id)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.layercache/layercache.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_host_worker() {
        let cfg = LayercacheConfig::default();
        assert_eq!(cfg.scheduler.initial_delay_ms, 1_000);
        assert_eq!(cfg.scheduler.retry.max_attempts, 1);
        assert!(cfg.scheduler.constraint_timeout_ms.is_none());
        assert!(cfg.conditions.network);
        assert!(cfg.layers.is_empty());
    }

    #[test]
    fn loads_toml_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "layercache.toml",
                r#"
                [scheduler]
                initial_delay_ms = 250
                constraint_timeout_ms = 60000

                [conditions]
                network = false

                [[layers]]
                id = 7
                name = "roads"
                rebuild_command = "true"
                "#,
            )?;
            jail.set_env("LAYERCACHE_SCHEDULER__MAX_CONCURRENT_REBUILDS", "4");

            let cfg = LayercacheConfig::load(Some("layercache.toml")).expect("load failed");
            assert_eq!(cfg.scheduler.initial_delay_ms, 250);
            assert_eq!(cfg.scheduler.max_concurrent_rebuilds, 4);
            assert_eq!(cfg.scheduler.constraint_timeout_ms, Some(60_000));
            assert!(!cfg.conditions.network);
            assert!(cfg.conditions.charging);
            let layer = cfg.layer(LayerId::try_from(7).unwrap()).expect("layer 7");
            assert_eq!(layer.name, "roads");
            Ok(())
        });
    }

    #[test]
    fn negative_layer_id_in_config_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "layercache.toml",
                r#"
                [[layers]]
                id = -1
                name = "broken"
                rebuild_command = "true"
                "#,
            )?;
            assert!(LayercacheConfig::load(Some("layercache.toml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn duplicate_layer_ids_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "layercache.toml",
                r#"
                [[layers]]
                id = 3
                name = "a"
                rebuild_command = "true"

                [[layers]]
                id = 3
                name = "b"
                rebuild_command = "true"
                "#,
            )?;
            let err = LayercacheConfig::load(Some("layercache.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = LayercacheConfig::default();
        cfg.scheduler.max_concurrent_rebuilds = 0;
        assert!(cfg.validate().is_err());
    }
}
