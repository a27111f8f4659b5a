pub mod binary;
pub mod events;
pub mod fingerprint;
pub mod identity;
pub mod recording;
pub mod traces;

pub use binary::BinaryRecording;
pub use events::{EventTrains, Spike};
pub use identity::{binding_fingerprint, AnalysisIdentity};
pub use recording::{check_chunk_request, InMemoryRecording, Recording};
pub use traces::Traces;
