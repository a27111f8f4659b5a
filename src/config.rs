use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::ExtensionCache;
use crate::engine::{default_n_jobs, log_progress, parse_duration, parse_memory, ChunkExecutor, ChunkPolicy};
use crate::error::{EngineError, Result};

pub const ENV_N_JOBS: &str = "SPIKETAB_N_JOBS";
pub const ENV_CHUNK_SIZE: &str = "SPIKETAB_CHUNK_SIZE";
pub const ENV_CHUNK_MEMORY: &str = "SPIKETAB_CHUNK_MEMORY";
pub const ENV_CHUNK_DURATION: &str = "SPIKETAB_CHUNK_DURATION";
pub const ENV_STORE_PATH: &str = "SPIKETAB_STORE_PATH";

/// Where extension entries live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Folder { path: PathBuf },
}

impl StoreConfig {
    pub fn open(&self) -> Result<ExtensionCache> {
        match self {
            StoreConfig::Memory => Ok(ExtensionCache::memory()),
            StoreConfig::Folder { path } => ExtensionCache::folder(path),
        }
    }
}

/// Job settings shared by every analysis of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub n_jobs: usize,
    pub chunk_policy: ChunkPolicy,
    pub progress: bool,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_jobs: default_n_jobs(),
            chunk_policy: ChunkPolicy::default(),
            progress: false,
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    n_jobs: Option<usize>,
    chunk_size: Option<usize>,
    chunk_memory: Option<Value>,
    chunk_duration: Option<Value>,
    progress: Option<bool>,
    store: Option<StoreConfig>,
}

impl EngineConfig {
    /// Parse a JSON job configuration such as
    /// `{"n_jobs": 4, "chunk_memory": "10M", "store": {"kind": "folder", "path": "out"}}`.
    /// At most one of `chunk_size`, `chunk_memory`, `chunk_duration` may be set.
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        let mut config = Self::default();
        if let Some(n_jobs) = raw.n_jobs {
            config.n_jobs = resolve_n_jobs(n_jobs);
        }

        let policies = [
            raw.chunk_size.map(|samples| Ok(ChunkPolicy::FixedSamples { samples })),
            raw.chunk_memory.map(|v| {
                memory_value(&v).map(|bytes| ChunkPolicy::MemoryBudget { bytes })
            }),
            raw.chunk_duration.map(|v| {
                duration_value(&v).map(|seconds| ChunkPolicy::Duration { seconds })
            }),
        ];
        let mut policies: Vec<Result<ChunkPolicy>> = policies.into_iter().flatten().collect();
        match policies.len() {
            0 => {}
            1 => config.chunk_policy = policies.remove(0)?,
            _ => {
                return Err(EngineError::InvalidConfig(
                    "set only one of chunk_size, chunk_memory, chunk_duration".to_string(),
                ))
            }
        }
        if config.chunk_policy == (ChunkPolicy::FixedSamples { samples: 0 }) {
            return Err(EngineError::InvalidConfig(
                "chunk_size must be positive".to_string(),
            ));
        }

        if let Some(progress) = raw.progress {
            config.progress = progress;
        }
        if let Some(store) = raw.store {
            config.store = store;
        }
        Ok(config)
    }

    /// Defaults overlaid with the `SPIKETAB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` (keyed by the `SPIKETAB_*` names).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n_jobs) = lookup(ENV_N_JOBS) {
            let n: usize = n_jobs.trim().parse().map_err(|_| {
                EngineError::InvalidConfig(format!("{ENV_N_JOBS} must be an integer, got `{n_jobs}`"))
            })?;
            self.n_jobs = resolve_n_jobs(n);
        }

        let size = lookup(ENV_CHUNK_SIZE);
        let memory = lookup(ENV_CHUNK_MEMORY);
        let duration = lookup(ENV_CHUNK_DURATION);
        let set = [&size, &memory, &duration].iter().filter(|v| v.is_some()).count();
        if set > 1 {
            return Err(EngineError::InvalidConfig(format!(
                "set only one of {ENV_CHUNK_SIZE}, {ENV_CHUNK_MEMORY}, {ENV_CHUNK_DURATION}"
            )));
        }
        if let Some(size) = size {
            let samples: usize = size
                .trim()
                .parse()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    EngineError::InvalidConfig(format!(
                        "{ENV_CHUNK_SIZE} must be a positive integer, got `{size}`"
                    ))
                })?;
            self.chunk_policy = ChunkPolicy::FixedSamples { samples };
        }
        if let Some(memory) = memory {
            self.chunk_policy = ChunkPolicy::MemoryBudget {
                bytes: parse_memory(&memory)?,
            };
        }
        if let Some(duration) = duration {
            self.chunk_policy = ChunkPolicy::Duration {
                seconds: parse_duration(&duration)?,
            };
        }

        if let Some(path) = lookup(ENV_STORE_PATH) {
            self.store = StoreConfig::Folder { path: path.into() };
        }
        Ok(self)
    }

    /// Executor carrying this configuration's parallelism, chunking and progress settings.
    pub fn executor(&self) -> ChunkExecutor {
        let executor = ChunkExecutor::new(self.n_jobs).with_policy(self.chunk_policy);
        if self.progress {
            executor.with_progress(log_progress())
        } else {
            executor
        }
    }

    pub fn open_cache(&self) -> Result<ExtensionCache> {
        self.store.open()
    }
}

fn resolve_n_jobs(n_jobs: usize) -> usize {
    if n_jobs == 0 {
        default_n_jobs()
    } else {
        n_jobs
    }
}

fn memory_value(value: &Value) -> Result<usize> {
    match value {
        Value::String(s) => parse_memory(s),
        Value::Number(n) => n
            .as_u64()
            .filter(|&b| b > 0)
            .map(|b| b as usize)
            .ok_or_else(|| EngineError::InvalidConfig(format!("invalid chunk_memory {n}"))),
        other => Err(EngineError::InvalidConfig(format!(
            "chunk_memory must be a string or a number, got {other}"
        ))),
    }
}

fn duration_value(value: &Value) -> Result<f64> {
    match value {
        Value::String(s) => parse_duration(s),
        Value::Number(n) => n
            .as_f64()
            .filter(|s| s.is_finite() && *s > 0.0)
            .ok_or_else(|| EngineError::InvalidConfig(format!("invalid chunk_duration {n}"))),
        other => Err(EngineError::InvalidConfig(format!(
            "chunk_duration must be a string or a number, got {other}"
        ))),
    }
}
