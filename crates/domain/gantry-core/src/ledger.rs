use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::VersionId;

/// Ledger value persisted as a signed integer; `-1` marks a file that is
/// mid-write so an interrupted run is detectable on the next start.
const IN_FLIGHT_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledVersion {
    Version(VersionId),
    InFlight,
}

impl Serialize for InstalledVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InstalledVersion::Version(v) => serializer.serialize_i64(*v as i64),
            InstalledVersion::InFlight => serializer.serialize_i64(IN_FLIGHT_SENTINEL),
        }
    }
}

impl<'de> Deserialize<'de> for InstalledVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw == IN_FLIGHT_SENTINEL {
            return Ok(InstalledVersion::InFlight);
        }
        u32::try_from(raw)
            .map(InstalledVersion::Version)
            .map_err(|_| serde::de::Error::custom(format!("invalid ledger version {raw}")))
    }
}

/// In-memory map of relative file path to installed version. Pure data;
/// durability lives one layer up in the pipeline's ledger store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerMap {
    entries: BTreeMap<String, InstalledVersion>,
}

impl LedgerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<InstalledVersion> {
        self.entries.get(path).copied()
    }

    pub fn set(&mut self, path: &str, version: InstalledVersion) {
        self.entries.insert(path.to_string(), version);
    }

    pub fn clear(&mut self, path: &str) {
        self.entries.remove(path);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn all_paths(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// The single version shared by every tracked file, or `None`.
    ///
    /// An empty ledger and a mixed-version ledger are indistinguishable here:
    /// both force the caller into the safe full-resync path. Any in-flight
    /// sentinel likewise yields `None`.
    pub fn common_version(&self) -> Option<VersionId> {
        let mut versions = self.entries.values();
        let first = match versions.next() {
            Some(InstalledVersion::Version(v)) => *v,
            Some(InstalledVersion::InFlight) | None => return None,
        };
        for entry in versions {
            match entry {
                InstalledVersion::Version(v) if *v == first => {}
                _ => return None,
            }
        }
        Some(first)
    }
}
