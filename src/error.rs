use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Who a chunked job runs on behalf of. Attached to chunk failures and
/// cancellations so they can be traced back without engine internals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobContext {
    pub extension: Option<String>,
    pub identity: Option<String>,
}

impl JobContext {
    pub fn new(extension: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            extension: Some(extension.into()),
            identity: Some(identity.into()),
        }
    }
}

impl fmt::Display for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.extension, &self.identity) {
            (Some(ext), Some(id)) => write!(f, "extension `{ext}` on analysis `{id}`"),
            (Some(ext), None) => write!(f, "extension `{ext}`"),
            (None, Some(id)) => write!(f, "analysis `{id}`"),
            (None, None) => write!(f, "anonymous job"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("samples {start}..{end} out of range for segment {segment} ({len} samples)")]
    OutOfRange {
        segment: usize,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("segment {segment} does not exist (recording has {num_segments})")]
    UnknownSegment { segment: usize, num_segments: usize },

    #[error("channel {channel} does not exist (recording has {num_channels})")]
    UnknownChannel { channel: usize, num_channels: usize },

    #[error("cyclic extension dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("unknown extension `{name}`{}", .required_by.as_ref().map(|r| format!(" (required by `{r}`)")).unwrap_or_default())]
    UnknownExtension {
        name: String,
        required_by: Option<String>,
    },

    #[error("extension `{name}` is already registered with a different contract")]
    DuplicateExtension { name: String },

    #[error("invalid {kind} name `{name}`: only ASCII letters, digits, `.`, `_` and `-` are allowed")]
    InvalidName { kind: &'static str, name: String },

    #[error("invalid parameter `{parameter}` for extension `{extension}`: {reason}")]
    InvalidParameter {
        extension: String,
        parameter: String,
        reason: String,
    },

    #[error("invalid event trains: {0}")]
    InvalidEvents(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("analysis identity `{identity}` is already bound to a different recording or event set")]
    IdentityConflict { identity: String },

    #[error("chunk computation failed for {context} in segment {segment}, samples {start}..{end}: {cause}")]
    ChunkComputation {
        context: JobContext,
        segment: usize,
        start: usize,
        end: usize,
        #[source]
        cause: anyhow::Error,
    },

    #[error("extension `{extension}` failed on analysis `{identity}`: {source}")]
    ComputeFailed {
        extension: String,
        identity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("execution cancelled for {context}")]
    Cancelled { context: JobContext },

    #[error("corrupted cache entry `{extension}` for analysis `{identity}`: {reason}")]
    CacheCorruption {
        identity: String,
        extension: String,
        reason: String,
    },

    #[error("invalid state transition for `{extension}`: {from} -> {to}")]
    InvalidStateTransition {
        extension: String,
        from: String,
        to: String,
    },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable, machine-readable code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "ST-OUT-OF-RANGE",
            Self::UnknownSegment { .. } => "ST-UNKNOWN-SEGMENT",
            Self::UnknownChannel { .. } => "ST-UNKNOWN-CHANNEL",
            Self::CyclicDependency { .. } => "ST-CYCLIC-DEPENDENCY",
            Self::UnknownExtension { .. } => "ST-UNKNOWN-EXTENSION",
            Self::DuplicateExtension { .. } => "ST-DUPLICATE-EXTENSION",
            Self::InvalidName { .. } => "ST-INVALID-NAME",
            Self::InvalidParameter { .. } => "ST-INVALID-PARAMETER",
            Self::InvalidEvents(_) => "ST-INVALID-EVENTS",
            Self::InvalidPayload(_) => "ST-INVALID-PAYLOAD",
            Self::InvalidConfig(_) => "ST-INVALID-CONFIG",
            Self::IdentityConflict { .. } => "ST-IDENTITY-CONFLICT",
            Self::ChunkComputation { .. } => "ST-CHUNK-COMPUTATION",
            Self::ComputeFailed { .. } => "ST-COMPUTE-FAILED",
            Self::Cancelled { .. } => "ST-CANCELLED",
            Self::CacheCorruption { .. } => "ST-CACHE-CORRUPTION",
            Self::InvalidStateTransition { .. } => "ST-INVALID-TRANSITION",
            Self::Io(_) => "ST-IO",
            Self::Json(_) => "ST-JSON",
        }
    }

    /// Resolution errors are raised before any computation starts.
    #[must_use]
    pub const fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. }
                | Self::UnknownExtension { .. }
                | Self::DuplicateExtension { .. }
                | Self::InvalidParameter { .. }
        )
    }

    /// Whether the error already names the extension it was raised for.
    #[must_use]
    pub const fn names_extension(&self) -> bool {
        matches!(
            self,
            Self::ChunkComputation { .. }
                | Self::Cancelled { .. }
                | Self::ComputeFailed { .. }
                | Self::InvalidParameter { .. }
                | Self::CacheCorruption { .. }
        )
    }

    /// Lift an error returned by an extension computation back into an engine
    /// error. Engine errors that already name their extension keep their
    /// variant; everything else is wrapped as `ComputeFailed`, with an inner
    /// engine error still reachable through `source`.
    pub fn from_compute(extension: &str, identity: &str, err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) if engine.names_extension() => engine,
            Ok(engine) => Self::ComputeFailed {
                extension: extension.to_string(),
                identity: identity.to_string(),
                source: anyhow::Error::new(engine),
            },
            Err(other) => Self::ComputeFailed {
                extension: extension.to_string(),
                identity: identity.to_string(),
                source: other,
            },
        }
    }
}

/// Names used as cache keys and directory names.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_context_display() {
        assert_eq!(JobContext::default().to_string(), "anonymous job");
        assert_eq!(
            JobContext::new("waveforms", "rec-1").to_string(),
            "extension `waveforms` on analysis `rec-1`"
        );
    }

    #[test]
    fn unknown_extension_message_mentions_requirer() {
        let err = EngineError::UnknownExtension {
            name: "pca".to_string(),
            required_by: Some("metrics".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "unknown extension `pca` (required by `metrics`)"
        );
        assert_eq!(err.error_code(), "ST-UNKNOWN-EXTENSION");
        assert!(err.is_resolution_error());
    }

    #[test]
    fn cycle_message_lists_path() {
        let err = EngineError::CyclicDependency {
            cycle: vec!["x".into(), "y".into(), "x".into()],
        };
        assert_eq!(err.to_string(), "cyclic extension dependency: x -> y -> x");
    }

    #[test]
    fn from_compute_attaches_context() {
        let inner = EngineError::OutOfRange {
            segment: 0,
            start: 10,
            end: 20,
            len: 15,
        };
        let lifted = EngineError::from_compute("ext", "id", anyhow::Error::new(inner));
        match &lifted {
            EngineError::ComputeFailed {
                extension,
                identity,
                source,
            } => {
                assert_eq!(extension, "ext");
                assert_eq!(identity, "id");
                assert!(matches!(
                    source.downcast_ref::<EngineError>(),
                    Some(EngineError::OutOfRange { end: 20, .. })
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            lifted.to_string(),
            "extension `ext` failed on analysis `id`: samples 10..20 out of range for segment 0 (15 samples)"
        );

        let cancelled = EngineError::Cancelled {
            context: JobContext::new("ext", "id"),
        };
        let kept = EngineError::from_compute("ext", "id", anyhow::Error::new(cancelled));
        assert!(matches!(kept, EngineError::Cancelled { .. }));

        let foreign = EngineError::from_compute("ext", "id", anyhow::anyhow!("boom"));
        match foreign {
            EngineError::ComputeFailed { source, .. } => assert_eq!(source.to_string(), "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("extension", "noise_levels").is_ok());
        assert!(validate_name("identity", "rec-1.v2").is_ok());
        assert!(validate_name("extension", "").is_err());
        assert!(validate_name("extension", "../etc").is_err());
        assert!(validate_name("extension", ".hidden").is_err());
        assert!(validate_name("extension", "a b").is_err());
    }
}
