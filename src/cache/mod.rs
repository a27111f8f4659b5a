//! Extension store: one entry per (analysis identity, extension name),
//! matched against the parameter hash on lookup.

mod backend;
mod folder;
mod memory;

pub use backend::StoreBackend;
pub use folder::FolderBackend;
pub use memory::MemoryBackend;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AnalysisIdentity;
use crate::error::{EngineError, Result};
use crate::extension::ExtensionData;
use crate::registry::ExtensionRegistry;

/// Version of the on-disk entry layout.
pub const FORMAT_VERSION: u32 = 1;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub identity: AnalysisIdentity,
    pub extension: String,
    pub param_hash: String,
}

impl CacheKey {
    pub fn new(
        identity: AnalysisIdentity,
        extension: impl Into<String>,
        param_hash: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            extension: extension.into(),
            param_hash: param_hash.into(),
        }
    }
}

/// Self-describing sidecar stored next to every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub format_version: u32,
    pub extension: String,
    pub identity: AnalysisIdentity,
    pub param_hash: String,
    pub params: serde_json::Value,
    /// Parameter hash of every direct dependency at compute time.
    #[serde(default)]
    pub upstream: BTreeMap<String, String>,
    pub computed_at: DateTime<Utc>,
    pub engine_version: String,
    pub schema_version: u32,
}

impl EntryMeta {
    pub fn new(key: &CacheKey, params: serde_json::Value, schema_version: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            extension: key.extension.clone(),
            identity: key.identity.clone(),
            param_hash: key.param_hash.clone(),
            params,
            upstream: BTreeMap::new(),
            computed_at: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
            schema_version,
        }
    }

    pub fn with_upstream(mut self, upstream: BTreeMap<String, String>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(
            self.identity.clone(),
            self.extension.clone(),
            self.param_hash.clone(),
        )
    }
}

/// A stored payload with its sidecar.
#[derive(Debug, Clone)]
pub struct StoredExtension {
    pub meta: EntryMeta,
    pub payload: Arc<ExtensionData>,
}

/// Binding between an analysis identity and the data it was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub identity: AnalysisIdentity,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub engine_version: String,
}

impl BindingRecord {
    pub fn new(identity: AnalysisIdentity, fingerprint: impl Into<String>) -> Self {
        Self {
            identity,
            fingerprint: fingerprint.into(),
            created_at: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
        }
    }
}

/// Readers of a key share it; writers hold it exclusively.
type KeyLock = Arc<RwLock<()>>;

/// Consistency layer over a [`StoreBackend`]: per-key reader/writer exclusion,
/// corruption handling and cascading invalidation.
pub struct ExtensionCache {
    backend: Arc<dyn StoreBackend>,
    locks: Mutex<HashMap<(AnalysisIdentity, String), KeyLock>>,
}

impl ExtensionCache {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn folder(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(FolderBackend::open(root)?)))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }

    fn key_lock(&self, identity: &AnalysisIdentity, extension: &str) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry((identity.clone(), extension.to_string()))
            .or_default()
            .clone()
    }

    /// The stored entry for `key`, if its parameter hash matches exactly.
    ///
    /// A parameter mismatch is a miss. A corrupted entry is logged, dropped
    /// and also reported as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<StoredExtension>> {
        let Some(entry) = self.peek(&key.identity, &key.extension)? else {
            return Ok(None);
        };
        if entry.meta.param_hash != key.param_hash {
            tracing::debug!(
                identity = %key.identity,
                extension = %key.extension,
                stored = %entry.meta.param_hash,
                requested = %key.param_hash,
                "parameter hash mismatch"
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// The stored entry for an extension regardless of its parameters.
    pub fn peek(
        &self,
        identity: &AnalysisIdentity,
        extension: &str,
    ) -> Result<Option<StoredExtension>> {
        let lock = self.key_lock(identity, extension);
        let loaded = {
            let _guard = lock.read().unwrap_or_else(|p| p.into_inner());
            self.backend.load(identity, extension)
        };
        match loaded {
            Err(err @ EngineError::CacheCorruption { .. }) => {
                tracing::warn!(
                    %identity,
                    extension,
                    error = %err,
                    code = err.error_code(),
                    "corrupted cache entry, recomputing"
                );
                let _guard = lock.write().unwrap_or_else(|p| p.into_inner());
                // a writer may have replaced the entry between the two locks
                match self.backend.load(identity, extension) {
                    Err(EngineError::CacheCorruption { .. }) => {
                        if let Err(e) = self.backend.remove(identity, extension) {
                            tracing::warn!(%identity, extension, error = %e, "failed to drop corrupted entry");
                        }
                        Ok(None)
                    }
                    reloaded => self.check_format(identity, extension, reloaded),
                }
            }
            loaded => self.check_format(identity, extension, loaded),
        }
    }

    fn check_format(
        &self,
        identity: &AnalysisIdentity,
        extension: &str,
        loaded: Result<Option<StoredExtension>>,
    ) -> Result<Option<StoredExtension>> {
        match loaded? {
            Some(entry) if entry.meta.format_version != FORMAT_VERSION => {
                tracing::warn!(
                    %identity,
                    extension,
                    format_version = entry.meta.format_version,
                    "unsupported entry format, treating as a miss"
                );
                Ok(None)
            }
            entry => Ok(entry),
        }
    }

    /// Write an entry, replacing whatever is stored for the same extension.
    /// Writers of the same key are serialized; last write wins.
    pub fn store(&self, entry: &StoredExtension) -> Result<()> {
        let lock = self.key_lock(&entry.meta.identity, &entry.meta.extension);
        let _guard = lock.write().unwrap_or_else(|p| p.into_inner());
        self.backend.save(entry)?;
        tracing::debug!(
            identity = %entry.meta.identity,
            extension = %entry.meta.extension,
            param_hash = %entry.meta.param_hash,
            backend = self.backend.name(),
            "stored extension"
        );
        Ok(())
    }

    /// Remove one entry without touching dependents.
    pub fn remove(&self, identity: &AnalysisIdentity, extension: &str) -> Result<bool> {
        let lock = self.key_lock(identity, extension);
        let _guard = lock.write().unwrap_or_else(|p| p.into_inner());
        self.backend.remove(identity, extension)
    }

    /// Remove `extension` and every stored extension that transitively
    /// depends on it. Returns the names actually removed.
    pub fn invalidate(
        &self,
        registry: &ExtensionRegistry,
        identity: &AnalysisIdentity,
        extension: &str,
    ) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        if self.remove(identity, extension)? {
            removed.push(extension.to_string());
        }
        for dependent in registry.dependents(extension) {
            if self.remove(identity, &dependent)? {
                removed.push(dependent);
            }
        }
        if !removed.is_empty() {
            tracing::info!(%identity, extension, removed = ?removed, "invalidated extensions");
        }
        Ok(removed)
    }

    /// Remove every entry and the binding of `identity`.
    pub fn delete(&self, identity: &AnalysisIdentity) -> Result<()> {
        self.backend.remove_all(identity)?;
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.retain(|(id, _), _| id != identity);
        tracing::info!(%identity, "deleted analysis from store");
        Ok(())
    }

    /// Names of every stored extension of `identity`, sorted.
    pub fn computed(&self, identity: &AnalysisIdentity) -> Result<Vec<String>> {
        let mut names = self.backend.list(identity)?;
        names.sort();
        Ok(names)
    }

    /// Bind `identity` to `fingerprint`, or check an existing binding.
    pub fn bind(&self, identity: &AnalysisIdentity, fingerprint: &str) -> Result<()> {
        match self.backend.binding(identity)? {
            Some(record) if record.fingerprint == fingerprint => Ok(()),
            Some(_) => Err(EngineError::IdentityConflict {
                identity: identity.to_string(),
            }),
            None => self
                .backend
                .bind(&BindingRecord::new(identity.clone(), fingerprint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::NdArray;
    use crate::registry::ExtensionDescriptor;
    use serde_json::json;

    fn entry(identity: &AnalysisIdentity, name: &str, hash: &str) -> StoredExtension {
        let key = CacheKey::new(identity.clone(), name, hash);
        StoredExtension {
            meta: EntryMeta::new(&key, json!({}), 1),
            payload: Arc::new(
                ExtensionData::new().with_array("x", NdArray::vector(vec![1.0, 2.0])),
            ),
        }
    }

    #[test]
    fn test_param_mismatch_is_a_miss() {
        let cache = ExtensionCache::memory();
        let id = AnalysisIdentity::new("a").unwrap();
        cache.store(&entry(&id, "waveforms", "h1")).unwrap();

        assert!(cache
            .lookup(&CacheKey::new(id.clone(), "waveforms", "h1"))
            .unwrap()
            .is_some());
        assert!(cache
            .lookup(&CacheKey::new(id.clone(), "waveforms", "h2"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalidate_cascades() {
        let registry = ExtensionRegistry::new();
        registry.register(ExtensionDescriptor::new("a")).unwrap();
        registry
            .register(ExtensionDescriptor::new("b").depends_on("a"))
            .unwrap();
        registry
            .register(ExtensionDescriptor::new("c").depends_on("b"))
            .unwrap();
        registry.register(ExtensionDescriptor::new("d")).unwrap();

        let cache = ExtensionCache::memory();
        let id = AnalysisIdentity::new("a1").unwrap();
        for name in ["a", "b", "c", "d"] {
            cache.store(&entry(&id, name, "h")).unwrap();
        }

        let removed = cache.invalidate(&registry, &id, "a").unwrap();
        assert_eq!(removed, vec!["a", "b", "c"]);
        assert_eq!(cache.computed(&id).unwrap(), vec!["d"]);
    }

    #[test]
    fn test_binding_conflict() {
        let cache = ExtensionCache::memory();
        let id = AnalysisIdentity::new("bound").unwrap();
        cache.bind(&id, "fp-1").unwrap();
        cache.bind(&id, "fp-1").unwrap();
        let err = cache.bind(&id, "fp-2").unwrap_err();
        assert!(matches!(err, EngineError::IdentityConflict { .. }));

        cache.delete(&id).unwrap();
        cache.bind(&id, "fp-2").unwrap();
    }
}
