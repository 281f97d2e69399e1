use serde::{Deserialize, Serialize};

pub mod formats;
pub mod ledger;
pub mod path_utils;

pub use ledger::{InstalledVersion, LedgerMap};

/// Server-assigned version number. Totally ordered; `0` (or an absent value
/// on the wire) means "no published version".
pub type VersionId = u32;

/// One published application version as the distribution service reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppVersion {
    pub id: VersionId,
    pub label: String,
    pub changelog: String,
    pub publish_time: i64,
    pub content_guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_guid: Option<String>,
    #[serde(default)]
    pub draft: bool,
}

/// Full content package description for one version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentSummary {
    pub size: i64,
    pub encryption_method: String,
    pub compression_method: String,
    pub files: Vec<ContentFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentFile {
    pub path: String,
    pub hash: String,
}

/// Incremental diff package description between a version and its
/// predecessor. The three path sets are disjoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffSummary {
    pub size: i64,
    pub encryption_method: String,
    pub compression_method: String,
    pub added_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub removed_files: Vec<String>,
}

impl DiffSummary {
    /// Classify an archive entry against the diff's declared path sets.
    pub fn classify(&self, path: &str) -> DiffEntryKind {
        if self.added_files.iter().any(|p| p == path) {
            DiffEntryKind::Added
        } else if self.modified_files.iter().any(|p| p == path) {
            DiffEntryKind::Modified
        } else {
            DiffEntryKind::Undeclared
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffEntryKind {
    Added,
    Modified,
    /// Present in the archive but in neither `added_files` nor
    /// `modified_files` - a fatal package inconsistency.
    Undeclared,
}
