//! Extension computation and caching engine for spike-sorting style
//! analyses: chunked parallel execution over recordings, dependency-ordered
//! derived results, and pluggable persistent storage.

// lets the derive macro name `::spiketab` from inside this crate
extern crate self as spiketab;

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod extension;
pub mod extensions;
pub mod logging;
pub mod observability;
pub mod registry;

pub use analyzer::{AnalysisPool, Analyzer, AnalyzerBuilder, ExtensionState};
pub use cache::{CacheKey, EntryMeta, ExtensionCache, FolderBackend, MemoryBackend, StoreBackend};
pub use config::{EngineConfig, StoreConfig};
pub use core::{AnalysisIdentity, BinaryRecording, EventTrains, InMemoryRecording, Recording, Traces};
pub use engine::{CancelToken, ChunkExecutor, ChunkJob, ChunkMeta, ChunkPolicy};
pub use error::{EngineError, Result};
pub use extension::{ComputeContext, Extension, ExtensionData, NdArray};
pub use registry::{ExtensionDescriptor, ExtensionRegistry, ParamKind, ParameterSchema, ResolvedParams};
pub use spiketab_macros::ExtensionParams;
