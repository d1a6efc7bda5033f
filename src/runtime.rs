//! Ambient stack: configuration, the embedder-facing `Runtime` handle, and
//! `RuntimeError` for the handful of setup-time failures that can't be
//! expressed in-band as a `nothing`/error object (spec.md §7 expansion).
//!
//! Mirrors the teacher's `NEPTUNE_THREADS` environment-variable
//! convention (`gc.rs`) and its `GcInitError`, generalized to the three
//! knobs this runtime actually needs tuned at startup.

use log::{info, warn};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;

use crate::barrier::DEFAULT_MERGE_THRESHOLD;
use crate::region::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid value for environment variable {var}: {source}")]
    Env {
        var: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("allocation failure acquiring backing memory: {0}")]
    OutOfMemory(String),
    #[error("runtime invariant violated: {0}")]
    InvariantViolation(String),
}

/// Tunable knobs threaded through the barrier, region allocator, and
/// refcount pool. Construct with [`Config::default`] or
/// [`Config::from_env`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Member-count threshold above which `omni_store_repair` prefers a
    /// region merge over a deep transmigration copy.
    pub merge_threshold: usize,
    /// Size of a freshly allocated region chunk, once the inline buffer
    /// and current chunk are both exhausted.
    pub default_chunk_size: usize,
    /// Soft cap, in bytes, on how much the small-object recycling pool
    /// (`refcount.rs`) is allowed to retain before it starts freeing
    /// instead of recycling. `0` means unbounded.
    pub pool_max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            pool_max_bytes: 0,
        }
    }
}

impl Config {
    fn parse_env_usize(var: &'static str) -> Result<Option<usize>, RuntimeError> {
        match std::env::var(var) {
            Ok(s) => s
                .parse::<usize>()
                .map(Some)
                .map_err(|source| RuntimeError::Env { var, source }),
            Err(_) => Ok(None),
        }
    }

    /// Build a `Config`, overriding defaults from `OMNI_MERGE_THRESHOLD`,
    /// `OMNI_DEFAULT_CHUNK_SIZE`, and `OMNI_POOL_MAX_BYTES` when set.
    pub fn from_env() -> Result<Config, RuntimeError> {
        let mut cfg = Config::default();
        if let Some(v) = Self::parse_env_usize("OMNI_MERGE_THRESHOLD")? {
            cfg.merge_threshold = v;
        }
        if let Some(v) = Self::parse_env_usize("OMNI_DEFAULT_CHUNK_SIZE")? {
            cfg.default_chunk_size = v;
        }
        if let Some(v) = Self::parse_env_usize("OMNI_POOL_MAX_BYTES")? {
            cfg.pool_max_bytes = v;
        }
        info!("runtime config: {:?}", cfg);
        Ok(cfg)
    }
}

/// A configured runtime. Most embedders only ever touch [`global()`]; the
/// constructor is exposed directly for tests and for embedders running
/// more than one independently configured runtime in-process.
pub struct Runtime {
    config: RwLock<Config>,
}

impl Runtime {
    pub fn new(config: Config) -> Runtime {
        Runtime {
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write() = config;
    }
}

static GLOBAL: Lazy<Runtime> = Lazy::new(|| match Config::from_env() {
    Ok(cfg) => Runtime::new(cfg),
    Err(e) => {
        warn!("falling back to default config: {}", e);
        Runtime::new(Config::default())
    }
});

/// The process-wide runtime singleton, a thin convenience wrapper for
/// embedders that don't need more than one configured runtime (spec.md
/// §9's design note: "keep the global only as a thin wrapper").
pub fn global() -> &'static Runtime {
    &GLOBAL
}
