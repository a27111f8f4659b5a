use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use super::{BindingRecord, EntryMeta, StoreBackend, StoredExtension};
use crate::core::fingerprint::sha256_hex;
use crate::core::AnalysisIdentity;
use crate::error::{EngineError, Result};
use crate::extension::{ExtensionData, NdArray};

const BINDING_FILE: &str = "analysis.json";
const EXTENSIONS_DIR: &str = "extensions";
const SIDECAR_FILE: &str = "sidecar.json";
const PAYLOAD_FILE: &str = "payload.json";
const ARRAY_DTYPE: &str = "f64le";
const F64_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Debug, Serialize, Deserialize)]
struct ArrayManifest {
    key: String,
    dtype: String,
    shape: Vec<usize>,
    file: String,
    sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PayloadManifest {
    attrs: serde_json::Map<String, serde_json::Value>,
    arrays: Vec<ArrayManifest>,
}

/// Durable backend: one directory per identity, one sub-directory per
/// extension. Everything except the array files is JSON so entries can be
/// inspected without the engine.
///
/// ```text
/// <root>/<identity>/analysis.json
/// <root>/<identity>/extensions/<name>/sidecar.json
/// <root>/<identity>/extensions/<name>/payload.json
/// <root>/<identity>/extensions/<name>/array-000.f64
/// ```
pub struct FolderBackend {
    root: PathBuf,
}

impl FolderBackend {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), "opened folder store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_dir(&self, identity: &AnalysisIdentity) -> PathBuf {
        self.root.join(identity.as_str())
    }

    pub fn entry_dir(&self, identity: &AnalysisIdentity, extension: &str) -> PathBuf {
        self.identity_dir(identity).join(EXTENSIONS_DIR).join(extension)
    }

    fn scratch_dir(&self, identity: &AnalysisIdentity, label: &str, extension: &str) -> PathBuf {
        let suffix: u64 = rand::random();
        self.identity_dir(identity)
            .join(EXTENSIONS_DIR)
            .join(format!(".{label}-{extension}-{suffix:016x}"))
    }

    fn read_entry(&self, dir: &Path, identity: &AnalysisIdentity, extension: &str) -> Result<StoredExtension> {
        let corrupt = |reason: String| EngineError::CacheCorruption {
            identity: identity.to_string(),
            extension: extension.to_string(),
            reason,
        };

        let meta: EntryMeta = read_json(&dir.join(SIDECAR_FILE))
            .map_err(|e| corrupt(format!("unreadable sidecar: {e}")))?;
        if meta.extension != extension || &meta.identity != identity {
            return Err(corrupt(format!(
                "sidecar belongs to `{}` on `{}`",
                meta.extension, meta.identity
            )));
        }
        let manifest: PayloadManifest = read_json(&dir.join(PAYLOAD_FILE))
            .map_err(|e| corrupt(format!("unreadable payload manifest: {e}")))?;

        let mut payload = ExtensionData {
            arrays: BTreeMap::new(),
            attrs: manifest.attrs,
        };
        for array in manifest.arrays {
            if array.dtype != ARRAY_DTYPE {
                return Err(corrupt(format!(
                    "array `{}` has unsupported dtype {}",
                    array.key, array.dtype
                )));
            }
            let data = read_array(&dir.join(&array.file), &array.sha256).map_err(corrupt)?;
            let nd = NdArray::new(array.shape, data)
                .map_err(|e| corrupt(format!("array `{}`: {e}", array.key)))?;
            payload.arrays.insert(array.key, nd);
        }

        Ok(StoredExtension {
            meta,
            payload: Arc::new(payload),
        })
    }

    fn write_entry(&self, dir: &Path, entry: &StoredExtension) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut arrays = Vec::with_capacity(entry.payload.arrays.len());
        for (i, (key, array)) in entry.payload.arrays.iter().enumerate() {
            let file = format!("array-{i:03}.f64");
            let mut bytes = Vec::with_capacity(array.len() * F64_BYTES);
            for value in array.data() {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            write_synced(&dir.join(&file), &bytes)?;
            arrays.push(ArrayManifest {
                key: key.clone(),
                dtype: ARRAY_DTYPE.to_string(),
                shape: array.shape().to_vec(),
                file,
                sha256: sha256_hex(&bytes),
            });
        }

        let manifest = PayloadManifest {
            attrs: entry.payload.attrs.clone(),
            arrays,
        };
        write_synced(
            &dir.join(PAYLOAD_FILE),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )?;
        // sidecar last: its presence marks a complete entry
        write_synced(
            &dir.join(SIDECAR_FILE),
            serde_json::to_string_pretty(&entry.meta)?.as_bytes(),
        )?;
        Ok(())
    }
}

impl StoreBackend for FolderBackend {
    fn name(&self) -> &'static str {
        "folder"
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn load(
        &self,
        identity: &AnalysisIdentity,
        extension: &str,
    ) -> Result<Option<StoredExtension>> {
        let dir = self.entry_dir(identity, extension);
        if !dir.is_dir() {
            return Ok(None);
        }
        self.read_entry(&dir, identity, extension).map(Some)
    }

    fn save(&self, entry: &StoredExtension) -> Result<()> {
        let identity = &entry.meta.identity;
        let extension = &entry.meta.extension;
        let target = self.entry_dir(identity, extension);
        let staging = self.scratch_dir(identity, "tmp", extension);

        if let Err(e) = self.write_entry(&staging, entry) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        // directories cannot be renamed over, so park the old entry first
        let trash = self.scratch_dir(identity, "trash", extension);
        let parked = match fs::rename(&target, &trash) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
        };
        if let Err(e) = fs::rename(&staging, &target) {
            if parked {
                let _ = fs::rename(&trash, &target);
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        if parked {
            if let Err(e) = fs::remove_dir_all(&trash) {
                tracing::warn!(path = %trash.display(), error = %e, "failed to clean replaced entry");
            }
        }
        Ok(())
    }

    fn remove(&self, identity: &AnalysisIdentity, extension: &str) -> Result<bool> {
        let target = self.entry_dir(identity, extension);
        let trash = self.scratch_dir(identity, "trash", extension);
        match fs::rename(&target, &trash) {
            Ok(()) => {
                fs::remove_dir_all(&trash)?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, identity: &AnalysisIdentity) -> Result<Vec<String>> {
        let dir = self.identity_dir(identity).join(EXTENSIONS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.path().join(SIDECAR_FILE).is_file() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn remove_all(&self, identity: &AnalysisIdentity) -> Result<()> {
        match fs::remove_dir_all(self.identity_dir(identity)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn binding(&self, identity: &AnalysisIdentity) -> Result<Option<BindingRecord>> {
        let path = self.identity_dir(identity).join(BINDING_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    fn bind(&self, record: &BindingRecord) -> Result<()> {
        let dir = self.identity_dir(&record.identity);
        fs::create_dir_all(&dir)?;
        let path = dir.join(BINDING_FILE);
        let tmp = path.with_extension("json.tmp");
        write_synced(&tmp, serde_json::to_string_pretty(record)?.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn read_array(path: &Path, expected_sha256: &str) -> std::result::Result<Vec<f64>, String> {
    let file = File::open(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let len = file
        .metadata()
        .map_err(|e| format!("{}: {e}", path.display()))?
        .len();
    if len == 0 {
        return if sha256_hex(&[]) == expected_sha256 {
            Ok(Vec::new())
        } else {
            Err(format!("{}: checksum mismatch", path.display()))
        };
    }

    // SAFETY: entry files are only replaced by renaming whole directories,
    // never written in place, so the mapped bytes stay stable while read.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| format!("{}: {e}", path.display()))?;
    if map.len() % F64_BYTES != 0 {
        return Err(format!(
            "{}: {} bytes is not a whole number of f64 values",
            path.display(),
            map.len()
        ));
    }
    if sha256_hex(&map) != expected_sha256 {
        return Err(format!("{}: checksum mismatch", path.display()));
    }

    Ok(map
        .chunks_exact(F64_BYTES)
        .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use serde_json::json;

    fn entry(identity: &AnalysisIdentity, name: &str, value: f64) -> StoredExtension {
        let key = CacheKey::new(identity.clone(), name, format!("hash-{value}"));
        StoredExtension {
            meta: EntryMeta::new(&key, json!({"value": value}), 1),
            payload: Arc::new(
                ExtensionData::new()
                    .with_array("data", NdArray::new(vec![2, 2], vec![value; 4]).unwrap())
                    .with_array("empty", NdArray::new(vec![0, 3], Vec::new()).unwrap())
                    .with_attr("label", json!("layout")),
            ),
        }
    }

    #[test]
    fn test_save_load_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FolderBackend::open(dir.path()).unwrap();
        let id = AnalysisIdentity::new("session-1").unwrap();

        backend.save(&entry(&id, "templates", 1.0)).unwrap();
        backend.save(&entry(&id, "templates", 2.0)).unwrap();

        let loaded = backend.load(&id, "templates").unwrap().unwrap();
        assert_eq!(loaded.meta.param_hash, "hash-2");
        assert_eq!(loaded.payload.array("data").unwrap().data(), &[2.0; 4]);
        assert_eq!(loaded.payload.array("empty").unwrap().shape(), &[0, 3]);
        assert_eq!(loaded.payload.attr("label"), Some(&json!("layout")));
        assert_eq!(backend.list(&id).unwrap(), vec!["templates"]);
    }

    #[test]
    fn test_tampered_array_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FolderBackend::open(dir.path()).unwrap();
        let id = AnalysisIdentity::new("session-2").unwrap();
        backend.save(&entry(&id, "waveforms", 1.0)).unwrap();

        let array = backend.entry_dir(&id, "waveforms").join("array-000.f64");
        fs::write(&array, 9.0f64.to_le_bytes().repeat(4)).unwrap();

        let err = backend.load(&id, "waveforms").unwrap_err();
        assert!(matches!(err, EngineError::CacheCorruption { .. }));
    }

    #[test]
    fn test_staging_dirs_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FolderBackend::open(dir.path()).unwrap();
        let id = AnalysisIdentity::new("session-3").unwrap();
        fs::create_dir_all(backend.identity_dir(&id).join(EXTENSIONS_DIR).join(".tmp-x-1")).unwrap();
        fs::create_dir_all(backend.entry_dir(&id, "half-written")).unwrap();
        assert!(backend.list(&id).unwrap().is_empty());
    }
}
