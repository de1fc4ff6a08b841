//! Persistent registry of accepted capabilities.
//!
//! Each capability gets its own directory under the registry root holding
//! the module source and a manifest; the in-memory index is rebuilt from the
//! manifests at startup. Registering a capability under an existing name
//! replaces the previous entry, so the latest accepted module wins.

use std::path::PathBuf;
use std::sync::RwLock;

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::synthesizer::{fnv1a64, slugify};
use crate::types::{CapabilityRecord, Category};

const MODULE_FILE: &str = "module.py";
const MANIFEST_FILE: &str = "manifest.json";

pub struct CapabilityRegistry {
    root_dir: Option<PathBuf>,
    entries: RwLock<IndexMap<String, CapabilityRecord>>,
}

impl CapabilityRegistry {
    /// Registry with no persistence, for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            root_dir: None,
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Open a registry rooted at `root_dir`, creating it if needed and
    /// loading every capability already stored there.
    pub fn open(root_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;

        let mut entries = IndexMap::new();
        for entry in std::fs::read_dir(&root_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let manifest_path = entry.path().join(MANIFEST_FILE);
            let raw = match std::fs::read_to_string(&manifest_path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(dir = %entry.path().display(), error = %e, "skipping capability without readable manifest");
                    continue;
                }
            };
            match serde_json::from_str::<CapabilityRecord>(&raw) {
                Ok(record) => {
                    entries.insert(record.name.clone(), record);
                }
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "skipping malformed capability manifest");
                }
            }
        }

        info!(
            root = %root_dir.display(),
            capabilities = entries.len(),
            "loaded capability registry"
        );
        Ok(Self {
            root_dir: Some(root_dir),
            entries: RwLock::new(entries),
        })
    }

    /// Store an accepted capability. Returns true when it replaced an
    /// earlier entry with the same name.
    pub fn register(&self, record: CapabilityRecord) -> EngineResult<bool> {
        if let Some(root) = &self.root_dir {
            let dir = root.join(capability_dir_name(&record.name));
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(MODULE_FILE), &record.module.source_code)?;
            std::fs::write(
                dir.join(MANIFEST_FILE),
                serde_json::to_string_pretty(&record)?,
            )?;
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| EngineError::Registry("registry lock poisoned".to_string()))?;
        let replaced = entries.insert(record.name.clone(), record).is_some();
        Ok(replaced)
    }

    /// Look a capability up by its derived name.
    pub fn find(&self, name: &str) -> Option<CapabilityRecord> {
        self.entries.read().ok()?.get(name).cloned()
    }

    pub fn list(&self) -> Vec<CapabilityRecord> {
        self.entries
            .read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All capabilities in one category, in registration order.
    pub fn by_category(&self, category: Category) -> Vec<CapabilityRecord> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .values()
                    .filter(|record| record.module.category == category)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deterministic directory name, so re-registering a capability overwrites
/// its own directory instead of accumulating copies.
fn capability_dir_name(name: &str) -> String {
    format!("{}-{:08x}", slugify(name), fnv1a64(name) as u32)
}
