//! Seams to the host map: layer lookup and the rebuild operation.
//!
//! Both are blocking by contract. The executor calls them from Tokio's
//! blocking pool, never from a scheduler task.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use layercache_core::LayerId;

/// Why a layer id could not be turned into a rebuildable layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("layer {id} not found")]
    NotFound { id: LayerId },

    /// The layer exists but has no rebuildable cache (e.g. a raster layer).
    #[error("layer {id} is a {kind} layer and has no rebuildable cache")]
    IncompatibleKind { id: LayerId, kind: String },

    #[error("layer registry unavailable: {0}")]
    Unavailable(String),
}

/// Error reported by a layer's rebuild operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct RebuildError(pub String);

impl RebuildError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// Progress sink handed to a running rebuild.
pub trait Progress: Send + Sync {
    fn set_max(&self, max: u64);
    fn set_value(&self, value: u64);
    fn set_message(&self, message: &str);
}

/// Discards all progress updates.
pub struct NoProgress;

impl Progress for NoProgress {
    fn set_max(&self, _max: u64) {}
    fn set_value(&self, _value: u64) {}
    fn set_message(&self, _message: &str) {}
}

/// A layer whose derived cache (spatial index, tiles, ...) can be rebuilt.
pub trait CacheLayer: Send + Sync {
    fn id(&self) -> LayerId;

    fn name(&self) -> &str;

    /// Regenerate the cache from source data. May take a long time.
    fn rebuild_cache(&self, progress: &dyn Progress) -> Result<(), RebuildError>;
}

/// Resolves layer ids to layers. Injected into the scheduler at construction.
pub trait LayerRegistry: Send + Sync {
    fn resolve(&self, id: LayerId) -> Result<Arc<dyn CacheLayer>, ResolveError>;
}

enum Entry {
    Cacheable(Arc<dyn CacheLayer>),
    Other { kind: String },
}

/// In-process registry for embedding hosts and tests.
#[derive(Default)]
pub struct MemoryRegistry {
    layers: DashMap<LayerId, Entry>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a rebuildable layer under its own id.
    pub fn insert(&self, layer: Arc<dyn CacheLayer>) {
        self.layers.insert(layer.id(), Entry::Cacheable(layer));
    }

    /// Register a layer that exists but cannot be rebuilt.
    pub fn insert_other(&self, id: LayerId, kind: &str) {
        self.layers.insert(id, Entry::Other { kind: kind.to_string() });
    }

    pub fn remove(&self, id: LayerId) -> bool {
        self.layers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl LayerRegistry for MemoryRegistry {
    fn resolve(&self, id: LayerId) -> Result<Arc<dyn CacheLayer>, ResolveError> {
        match self.layers.get(&id).as_deref() {
            Some(Entry::Cacheable(layer)) => Ok(Arc::clone(layer)),
            Some(Entry::Other { kind }) => Err(ResolveError::IncompatibleKind {
                id,
                kind: kind.clone(),
            }),
            None => Err(ResolveError::NotFound { id }),
        }
    }
}
