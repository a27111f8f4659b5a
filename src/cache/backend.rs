use super::{BindingRecord, StoredExtension};
use crate::core::AnalysisIdentity;
use crate::error::Result;

/// Storage for extension entries and identity bindings.
///
/// A backend keeps at most one entry per (identity, extension). `save` must
/// be atomic for concurrent readers: `load` sees the old entry or the new
/// one, never a mix. Unreadable entries are reported as `CacheCorruption`.
pub trait StoreBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether entries survive the process.
    fn is_durable(&self) -> bool;

    fn load(&self, identity: &AnalysisIdentity, extension: &str)
        -> Result<Option<StoredExtension>>;

    fn save(&self, entry: &StoredExtension) -> Result<()>;

    /// Returns whether an entry existed.
    fn remove(&self, identity: &AnalysisIdentity, extension: &str) -> Result<bool>;

    /// Names of every stored extension of `identity`, in no particular order.
    fn list(&self, identity: &AnalysisIdentity) -> Result<Vec<String>>;

    /// Drop every entry and the binding of `identity`.
    fn remove_all(&self, identity: &AnalysisIdentity) -> Result<()>;

    fn binding(&self, identity: &AnalysisIdentity) -> Result<Option<BindingRecord>>;

    fn bind(&self, record: &BindingRecord) -> Result<()>;
}
