//! Per-analysis façade: resolves, computes, caches and invalidates
//! extensions for one recording + event trains pair.

mod pool;
mod state;

pub use pool::AnalysisPool;
pub use state::ExtensionState;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::cache::{CacheKey, EntryMeta, ExtensionCache, StoredExtension};
use crate::config::EngineConfig;
use crate::core::{binding_fingerprint, AnalysisIdentity, EventTrains, Recording};
use crate::engine::{CancelToken, ChunkExecutor};
use crate::error::{EngineError, JobContext, Result};
use crate::extension::{ComputeContext, ExtensionData};
use crate::observability::{AnalysisMonitor, MetricsCollector};
use crate::registry::{ExtensionDescriptor, ExtensionRegistry, ResolvedParams};

pub struct AnalyzerBuilder {
    recording: Arc<dyn Recording>,
    events: Arc<EventTrains>,
    identity: Option<AnalysisIdentity>,
    registry: Option<Arc<ExtensionRegistry>>,
    cache: Option<Arc<ExtensionCache>>,
    config: EngineConfig,
    metrics: MetricsCollector,
}

impl AnalyzerBuilder {
    pub fn identity(mut self, identity: AnalysisIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn registry(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Store to use instead of the one named by the configuration.
    pub fn cache(mut self, cache: Arc<ExtensionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the event trains against the recording and bind the
    /// identity in the store.
    pub fn build(self) -> Result<Analyzer> {
        self.events.check_against(self.recording.as_ref())?;

        let identity = match self.identity {
            Some(identity) => identity,
            None => AnalysisIdentity::from_content(self.recording.as_ref(), &self.events),
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(self.config.open_cache()?),
        };
        let fingerprint = binding_fingerprint(self.recording.as_ref(), &self.events);
        cache.bind(&identity, &fingerprint)?;

        let registry = self.registry.unwrap_or_else(ExtensionRegistry::global);
        tracing::info!(
            %identity,
            backend = cache.backend_name(),
            extensions = registry.len(),
            n_jobs = self.config.n_jobs,
            "analysis opened"
        );

        Ok(Analyzer {
            identity,
            recording: self.recording,
            events: self.events,
            registry,
            cache,
            executor: self.config.executor(),
            cancel: CancelToken::new(),
            metrics: self.metrics,
            states: Mutex::new(HashMap::new()),
            selected: Mutex::new(HashMap::new()),
            run_lock: Mutex::new(()),
        })
    }
}

/// Orchestrates extension requests for one analysis identity.
///
/// Requests on one analyzer are serialized; independent analyzers may run
/// concurrently and share a store.
pub struct Analyzer {
    identity: AnalysisIdentity,
    recording: Arc<dyn Recording>,
    events: Arc<EventTrains>,
    registry: Arc<ExtensionRegistry>,
    cache: Arc<ExtensionCache>,
    executor: ChunkExecutor,
    cancel: CancelToken,
    metrics: MetricsCollector,
    states: Mutex<HashMap<String, ExtensionState>>,
    /// Parameters last requested explicitly, per extension.
    selected: Mutex<HashMap<String, Value>>,
    run_lock: Mutex<()>,
}

struct Computed {
    payload: Arc<ExtensionData>,
    param_hash: String,
}

impl Analyzer {
    pub fn builder(recording: Arc<dyn Recording>, events: Arc<EventTrains>) -> AnalyzerBuilder {
        AnalyzerBuilder {
            recording,
            events,
            identity: None,
            registry: None,
            cache: None,
            config: EngineConfig::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn identity(&self) -> &AnalysisIdentity {
        &self.identity
    }

    pub fn recording(&self) -> &Arc<dyn Recording> {
        &self.recording
    }

    pub fn events(&self) -> &Arc<EventTrains> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ExtensionCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn monitor(&self) -> AnalysisMonitor {
        AnalysisMonitor::new(self.identity.as_str(), self.metrics.clone())
    }

    /// Token cancelling the request that is running when it fires.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Payload of `name`, computing it and any missing dependency first.
    ///
    /// With `params == None` the parameters last used for `name` are kept
    /// (or its defaults on a fresh analysis). A stored result with matching
    /// parameters and unchanged upstream is returned without recomputation.
    pub fn get(&self, name: &str, params: Option<&Value>) -> Result<Arc<ExtensionData>> {
        self.request(name, params, false)
    }

    /// Compute `name` again even if a matching result is stored. Every
    /// stored dependent is invalidated.
    pub fn recompute(&self, name: &str, params: Option<&Value>) -> Result<Arc<ExtensionData>> {
        self.request(name, params, true)
    }

    /// Whether a result for `name` is stored, whatever its parameters.
    pub fn has(&self, name: &str) -> Result<bool> {
        Ok(self.cache.peek(&self.identity, name)?.is_some())
    }

    /// Remove `name` and every stored extension depending on it. Returns the
    /// names actually removed.
    pub fn delete(&self, name: &str) -> Result<Vec<String>> {
        let _run = self.run_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.registry.require(name)?;
        let removed = self.cache.invalidate(&self.registry, &self.identity, name)?;
        for removed_name in &removed {
            self.reset_state(removed_name);
            if removed_name != name {
                self.metrics.for_extension(removed_name).record_invalidation();
            }
        }
        self.reset_state(name);
        Ok(removed)
    }

    /// Extensions with a stored result, in registration order. Works on a
    /// durable store after a restart without recomputing anything.
    pub fn computed_extensions(&self) -> Result<Vec<String>> {
        let stored = self.cache.computed(&self.identity)?;
        let mut names: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|n| stored.contains(n))
            .collect();
        names.extend(stored.into_iter().filter(|n| !self.registry.contains(n)));
        Ok(names)
    }

    pub fn state(&self, name: &str) -> ExtensionState {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Parameters a request for `name` without explicit parameters would use.
    pub fn params(&self, name: &str) -> Result<ResolvedParams> {
        let descriptor = self.registry.require(name)?;
        self.select_params(&descriptor, None)
    }

    /// Drop every stored result and the identity binding.
    pub fn destroy(self) -> Result<()> {
        let _run = self.run_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.cache.delete(&self.identity)
    }

    fn request(&self, name: &str, params: Option<&Value>, force: bool) -> Result<Arc<ExtensionData>> {
        let _run = self.run_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.cancel.reset();
        self.recover_interrupted();
        self.transition(name, ExtensionState::Resolving)?;

        let plan = match self.plan(name, params) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(identity = %self.identity, extension = name, error = %err, "resolution failed");
                self.fail(name, &err);
                return Err(err);
            }
        };
        self.transition(name, ExtensionState::AwaitingDependencies)?;

        let mut memo: BTreeMap<String, Computed> = BTreeMap::new();
        for (descriptor, resolved) in &plan {
            let is_target = descriptor.name == name;
            if let Err(err) = self.ensure(descriptor, resolved, force && is_target, &mut memo) {
                self.fail(&descriptor.name, &err);
                if !is_target {
                    self.fail(name, &err);
                }
                return Err(err);
            }
        }

        // only parameters that produced a result are remembered
        if let Some(params) = params {
            self.selected
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(name.to_string(), params.clone());
        }
        memo.remove(name)
            .map(|c| c.payload)
            .ok_or_else(|| EngineError::UnknownExtension {
                name: name.to_string(),
                required_by: None,
            })
    }

    /// Execution order with resolved parameters. Fails before any computation.
    fn plan(
        &self,
        name: &str,
        params: Option<&Value>,
    ) -> Result<Vec<(Arc<ExtensionDescriptor>, ResolvedParams)>> {
        let order = self.registry.resolve(&[name])?;
        tracing::debug!(identity = %self.identity, extension = name, order = ?order, "resolved");

        let mut plan = Vec::with_capacity(order.len());
        for ext in order {
            let descriptor = self.registry.require(&ext)?;
            let explicit = if ext == name { params } else { None };
            let resolved = self.select_params(&descriptor, explicit)?;
            plan.push((descriptor, resolved));
        }
        Ok(plan)
    }

    /// Remove every stored result computed on top of `name`.
    fn drop_dependents(&self, name: &str) -> Result<()> {
        for dependent in self.registry.dependents(name) {
            if self.cache.remove(&self.identity, &dependent)? {
                tracing::info!(identity = %self.identity, extension = name, dependent = %dependent, "invalidated dependent");
                self.metrics.for_extension(&dependent).record_invalidation();
            }
            self.reset_state(&dependent);
        }
        Ok(())
    }

    fn select_params(
        &self,
        descriptor: &ExtensionDescriptor,
        explicit: Option<&Value>,
    ) -> Result<ResolvedParams> {
        if let Some(params) = explicit {
            return ResolvedParams::resolve(descriptor, Some(params));
        }
        let remembered = self
            .selected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&descriptor.name)
            .cloned();
        if let Some(params) = remembered {
            return ResolvedParams::resolve(descriptor, Some(&params));
        }
        if let Some(entry) = self.cache.peek(&self.identity, &descriptor.name)? {
            match ResolvedParams::resolve(descriptor, Some(&entry.meta.params)) {
                Ok(resolved) => return Ok(resolved),
                Err(err) => tracing::debug!(
                    extension = %descriptor.name,
                    error = %err,
                    "stored parameters no longer valid, using defaults"
                ),
            }
        }
        ResolvedParams::resolve(descriptor, None)
    }

    fn ensure(
        &self,
        descriptor: &ExtensionDescriptor,
        params: &ResolvedParams,
        force: bool,
        memo: &mut BTreeMap<String, Computed>,
    ) -> Result<()> {
        let name = descriptor.name.as_str();
        if memo.contains_key(name) {
            return Ok(());
        }
        if self.state(name) != ExtensionState::AwaitingDependencies {
            self.transition(name, ExtensionState::Resolving)?;
            self.transition(name, ExtensionState::AwaitingDependencies)?;
        }

        let mut upstream = BTreeMap::new();
        let mut dependencies = BTreeMap::new();
        for dep in &descriptor.dependencies {
            let computed = memo.get(dep).ok_or_else(|| EngineError::UnknownExtension {
                name: dep.clone(),
                required_by: Some(name.to_string()),
            })?;
            upstream.insert(dep.clone(), computed.param_hash.clone());
            dependencies.insert(dep.clone(), computed.payload.clone());
        }

        let key = CacheKey::new(self.identity.clone(), name, params.hash());
        let metrics = self.metrics.for_extension(name);

        if !force {
            if let Some(entry) = self.cache.lookup(&key)? {
                if entry.meta.upstream == upstream
                    && entry.meta.schema_version == descriptor.schema_version
                {
                    tracing::debug!(identity = %self.identity, extension = name, "cache hit");
                    metrics.record_cache_hit();
                    self.transition(name, ExtensionState::Cached)?;
                    memo.insert(
                        name.to_string(),
                        Computed {
                            payload: entry.payload,
                            param_hash: entry.meta.param_hash,
                        },
                    );
                    return Ok(());
                }
                tracing::info!(identity = %self.identity, extension = name, "stored result is stale");
            }
        }

        self.transition(name, ExtensionState::Computing)?;
        tracing::info!(identity = %self.identity, extension = name, param_hash = %params.hash(), "computing");

        let executor = self
            .executor
            .clone()
            .with_cancel(self.cancel.clone())
            .with_context(JobContext::new(name, self.identity.as_str()))
            .with_metrics(metrics.clone());
        let ctx = ComputeContext::new(
            name,
            &self.identity,
            self.recording.as_ref(),
            &self.events,
            params,
            &dependencies,
            &executor,
        );

        let started = metrics.start_computation();
        let outcome = descriptor
            .compute()
            .compute(&ctx)
            .map_err(|e| EngineError::from_compute(name, self.identity.as_str(), e))
            .and_then(|payload| {
                if self.cancel.is_cancelled() {
                    Err(EngineError::Cancelled {
                        context: executor.context().clone(),
                    })
                } else {
                    Ok(payload)
                }
            });

        let payload = match outcome {
            Ok(payload) => Arc::new(payload),
            Err(err) => {
                metrics.record_failure();
                tracing::warn!(
                    identity = %self.identity,
                    extension = name,
                    error = %err,
                    code = err.error_code(),
                    "computation failed"
                );
                self.fail(name, &err);
                return Err(err);
            }
        };
        metrics.finish_computation(started);

        // the old result stays valid until its replacement is ready
        if let Err(err) = self.drop_dependents(name) {
            metrics.record_failure();
            self.fail(name, &err);
            return Err(err);
        }
        let entry = StoredExtension {
            meta: EntryMeta::new(&key, params.to_value(), descriptor.schema_version)
                .with_upstream(upstream),
            payload: payload.clone(),
        };
        if let Err(err) = self.cache.store(&entry) {
            metrics.record_failure();
            self.fail(name, &err);
            return Err(err);
        }

        self.transition(name, ExtensionState::Cached)?;
        tracing::info!(
            identity = %self.identity,
            extension = name,
            latency_us = metrics.avg_latency_us(),
            "computed"
        );
        memo.insert(
            name.to_string(),
            Computed {
                payload,
                param_hash: params.hash().to_string(),
            },
        );
        Ok(())
    }

    fn transition(&self, name: &str, target: ExtensionState) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let current = states.entry(name.to_string()).or_default();
        if *current == target {
            return Ok(());
        }
        if !current.can_transition_to(&target) {
            return Err(EngineError::InvalidStateTransition {
                extension: name.to_string(),
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        tracing::trace!(extension = name, from = %current, to = %target, "state transition");
        *current = target;
        Ok(())
    }

    fn fail(&self, name: &str, err: &EngineError) {
        let failed = ExtensionState::failed(err.error_code(), err.to_string());
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let current = states.entry(name.to_string()).or_default();
        if current.can_transition_to(&failed) {
            *current = failed;
        }
    }

    /// A request that panicked leaves states mid-flight; no request is
    /// running while the run lock is held, so those are failures.
    fn recover_interrupted(&self) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        for state in states.values_mut() {
            if matches!(
                state,
                ExtensionState::Resolving
                    | ExtensionState::AwaitingDependencies
                    | ExtensionState::Computing
            ) {
                *state = ExtensionState::failed("ST-INTERRUPTED", "request interrupted");
            }
        }
    }

    fn reset_state(&self, name: &str) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = states.get_mut(name) {
            if current.can_transition_to(&ExtensionState::NotRequested) {
                *current = ExtensionState::NotRequested;
            }
        }
    }
}
