use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{BindingRecord, StoreBackend, StoredExtension};
use crate::core::AnalysisIdentity;
use crate::error::Result;

#[derive(Default)]
struct Namespace {
    binding: Option<BindingRecord>,
    entries: BTreeMap<String, StoredExtension>,
}

/// Ephemeral backend. Payloads are shared, never copied.
#[derive(Default)]
pub struct MemoryBackend {
    namespaces: RwLock<HashMap<AnalysisIdentity, Namespace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn load(
        &self,
        identity: &AnalysisIdentity,
        extension: &str,
    ) -> Result<Option<StoredExtension>> {
        let namespaces = self.namespaces.read().unwrap_or_else(|p| p.into_inner());
        Ok(namespaces
            .get(identity)
            .and_then(|ns| ns.entries.get(extension))
            .cloned())
    }

    fn save(&self, entry: &StoredExtension) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|p| p.into_inner());
        namespaces
            .entry(entry.meta.identity.clone())
            .or_default()
            .entries
            .insert(entry.meta.extension.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, identity: &AnalysisIdentity, extension: &str) -> Result<bool> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|p| p.into_inner());
        Ok(namespaces
            .get_mut(identity)
            .map(|ns| ns.entries.remove(extension).is_some())
            .unwrap_or(false))
    }

    fn list(&self, identity: &AnalysisIdentity) -> Result<Vec<String>> {
        let namespaces = self.namespaces.read().unwrap_or_else(|p| p.into_inner());
        Ok(namespaces
            .get(identity)
            .map(|ns| ns.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn remove_all(&self, identity: &AnalysisIdentity) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|p| p.into_inner());
        namespaces.remove(identity);
        Ok(())
    }

    fn binding(&self, identity: &AnalysisIdentity) -> Result<Option<BindingRecord>> {
        let namespaces = self.namespaces.read().unwrap_or_else(|p| p.into_inner());
        Ok(namespaces.get(identity).and_then(|ns| ns.binding.clone()))
    }

    fn bind(&self, record: &BindingRecord) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|p| p.into_inner());
        namespaces.entry(record.identity.clone()).or_default().binding = Some(record.clone());
        Ok(())
    }
}
