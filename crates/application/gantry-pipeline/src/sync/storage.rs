use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use gantry_config::LEDGER_FILE_NAME;
use gantry_core::ledger::{InstalledVersion, LedgerMap};
use gantry_core::VersionId;

use crate::sync::SyncError;

/// Durable storage behind the version ledger.
pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<LedgerMap, SyncError>;
    fn save(&self, map: &LedgerMap) -> Result<(), SyncError>;
}

/// JSON file next to the install, written atomically (tmp + rename).
pub struct FileLedgerStore {
    path: Utf8PathBuf,
}

impl FileLedgerStore {
    pub fn new(install_root: &Utf8Path) -> Self {
        Self {
            path: install_root.join(LEDGER_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl LedgerStore for FileLedgerStore {
    fn load(&self) -> Result<LedgerMap, SyncError> {
        if !self.path.exists() {
            return Ok(LedgerMap::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| SyncError::Ledger(format!("read {}: {e}", self.path)))?;
        match serde_json::from_str(&data) {
            Ok(map) => Ok(map),
            Err(_) => {
                // An unreadable ledger forces the safe full-resync path.
                let _ = std::fs::remove_file(&self.path);
                Ok(LedgerMap::new())
            }
        }
    }

    fn save(&self, map: &LedgerMap) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Ledger(format!("create {parent}: {e}")))?;
        }
        let tmp = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(map)
            .map_err(|e| SyncError::Ledger(format!("serialize ledger: {e}")))?;
        std::fs::write(&tmp, data).map_err(|e| SyncError::Ledger(format!("write {tmp}: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SyncError::Ledger(format!("rename {tmp}: {e}")))?;
        Ok(())
    }
}

/// In-memory store for hosts and tests that do not want a file on disk.
#[derive(Default)]
pub struct MemoryLedgerStore {
    map: Mutex<LedgerMap>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(map: LedgerMap) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<LedgerMap, SyncError> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn save(&self, map: &LedgerMap) -> Result<(), SyncError> {
        *self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = map.clone();
        Ok(())
    }
}

/// Write-through ledger: every mutation persists to the store before it
/// returns, so an interrupted run is always visible on the next start.
pub struct VersionLedger {
    store: Arc<dyn LedgerStore>,
    map: LedgerMap,
}

impl VersionLedger {
    pub fn load(store: Arc<dyn LedgerStore>) -> Result<Self, SyncError> {
        let map = store.load()?;
        Ok(Self { store, map })
    }

    pub fn get(&self, path: &str) -> Option<InstalledVersion> {
        self.map.get(path)
    }

    pub fn all_paths(&self) -> BTreeSet<String> {
        self.map.all_paths()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn common_version(&self) -> Option<VersionId> {
        self.map.common_version()
    }

    pub fn set(&mut self, path: &str, version: InstalledVersion) -> Result<(), SyncError> {
        self.map.set(path, version);
        self.store.save(&self.map)
    }

    pub fn clear(&mut self, path: &str) -> Result<(), SyncError> {
        self.map.clear(path);
        self.store.save(&self.map)
    }

    pub fn clear_all(&mut self) -> Result<(), SyncError> {
        self.map.clear_all();
        self.store.save(&self.map)
    }

    /// Move every entry currently at `from` to `to` in one persisted write.
    pub fn retag(&mut self, from: VersionId, to: VersionId) -> Result<(), SyncError> {
        for path in self.map.all_paths() {
            if self.map.get(&path) == Some(InstalledVersion::Version(from)) {
                self.map.set(&path, InstalledVersion::Version(to));
            }
        }
        self.store.save(&self.map)
    }
}
