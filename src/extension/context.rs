use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::ExtensionData;
use crate::core::{AnalysisIdentity, EventTrains, Recording};
use crate::engine::ChunkExecutor;
use crate::error::EngineError;
use crate::registry::ResolvedParams;

/// Everything a computation may read. Dependencies are already computed and
/// resolved with their own parameters.
pub struct ComputeContext<'a> {
    pub(crate) extension: &'a str,
    pub(crate) identity: &'a AnalysisIdentity,
    pub(crate) recording: &'a dyn Recording,
    pub(crate) events: &'a EventTrains,
    pub(crate) params: &'a ResolvedParams,
    pub(crate) dependencies: &'a BTreeMap<String, Arc<ExtensionData>>,
    pub(crate) executor: &'a ChunkExecutor,
}

impl<'a> ComputeContext<'a> {
    pub fn new(
        extension: &'a str,
        identity: &'a AnalysisIdentity,
        recording: &'a dyn Recording,
        events: &'a EventTrains,
        params: &'a ResolvedParams,
        dependencies: &'a BTreeMap<String, Arc<ExtensionData>>,
        executor: &'a ChunkExecutor,
    ) -> Self {
        Self {
            extension,
            identity,
            recording,
            events,
            params,
            dependencies,
            executor,
        }
    }

    pub fn extension(&self) -> &str {
        self.extension
    }

    pub fn identity(&self) -> &AnalysisIdentity {
        self.identity
    }

    pub fn recording(&self) -> &dyn Recording {
        self.recording
    }

    pub fn events(&self) -> &EventTrains {
        self.events
    }

    pub fn params(&self) -> &ResolvedParams {
        self.params
    }

    /// Resolved parameters decoded into a typed struct.
    pub fn decode_params<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(self.params.decode()?)
    }

    /// Payload of a declared dependency.
    pub fn dependency(&self, name: &str) -> anyhow::Result<&ExtensionData> {
        self.dependencies
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| {
                EngineError::UnknownExtension {
                    name: name.to_string(),
                    required_by: Some(self.extension.to_string()),
                }
                .into()
            })
    }

    /// Executor configured for this job: context, cancellation and metrics
    /// are already attached.
    pub fn executor(&self) -> &ChunkExecutor {
        self.executor
    }
}
