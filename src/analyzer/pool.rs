use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::Analyzer;
use crate::error::{EngineError, Result};
use crate::extension::ExtensionData;

/// Runs extension requests for many analyses on the blocking thread pool,
/// at most `max_concurrent` at a time.
pub struct AnalysisPool {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl AnalysisPool {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Spawn `analyzer.get(extension, params)`. The request waits for a
    /// permit before it starts.
    pub fn execute(
        &self,
        analyzer: Arc<Analyzer>,
        extension: impl Into<String>,
        params: Option<Value>,
    ) -> JoinHandle<Result<Arc<ExtensionData>>> {
        let extension = extension.into();
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            let identity = analyzer.identity().to_string();
            let pool_failure = |extension: &str, cause: anyhow::Error| EngineError::ComputeFailed {
                extension: extension.to_string(),
                identity: identity.clone(),
                source: cause,
            };

            // Permit is held until the blocking request returns
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| pool_failure(&extension, anyhow!("pool closed: {e}")))?;

            let name = extension.clone();
            tokio::task::spawn_blocking(move || analyzer.get(&name, params.as_ref()))
                .await
                .map_err(|e| pool_failure(&extension, anyhow!("request task failed: {e}")))?
        })
    }

    /// Run every request and collect the outcomes in request order.
    pub async fn get_all(
        &self,
        requests: Vec<(Arc<Analyzer>, String)>,
    ) -> Vec<Result<Arc<ExtensionData>>> {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|(analyzer, extension)| self.execute(analyzer, extension, None))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(EngineError::ComputeFailed {
                    extension: String::new(),
                    identity: String::new(),
                    source: anyhow!("request task failed: {e}"),
                }),
            });
        }
        results
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
