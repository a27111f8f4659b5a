pub mod cancel;
pub mod chunks;
pub mod executor;
pub mod progress;

pub use cancel::CancelToken;
pub use chunks::{parse_duration, parse_memory, partition, plan_chunks, Chunk, ChunkPolicy};
pub use executor::{default_n_jobs, ChunkExecutor, ChunkJob, ChunkMeta};
pub use progress::{log_progress, ProgressCallback, ProgressUpdate};
