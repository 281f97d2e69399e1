use gantry_core::VersionId;
use gantry_infra::archive::ArchiveError;
use gantry_infra::hashing::HashError;
use gantry_infra::net::broker::BrokerError;
use gantry_infra::net::DownloadError;
use gantry_infra::patcher::PatchError;
use serde::Serialize;
use uuid::Uuid;

pub mod engine;
pub mod remote;
pub mod storage;

/// High-level error type for sync operations.
///
/// `Cancelled` always wins: a run whose scope was cancelled reports
/// `Cancelled` even when some underlying operation failed first.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote request failed: {0}")]
    Remote(BrokerError),
    #[error("malformed server response: {0}")]
    Api(String),
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("no published version available")]
    NothingPublished,
    #[error("inconsistent diff package: {0}")]
    InconsistentPackage(String),
    #[error("patch tool failed: {0}")]
    PatchTool(PatchError),
    #[error("archive error: {0}")]
    Archive(ArchiveError),
    #[error("download failed: {0}")]
    Download(DownloadError),
    #[error("local file error: {0}")]
    Local(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<BrokerError> for SyncError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Cancelled => SyncError::Cancelled,
            other => SyncError::Remote(other),
        }
    }
}

impl From<DownloadError> for SyncError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Cancelled => SyncError::Cancelled,
            other => SyncError::Download(other),
        }
    }
}

impl From<PatchError> for SyncError {
    fn from(e: PatchError) -> Self {
        match e {
            PatchError::Cancelled => SyncError::Cancelled,
            other => SyncError::PatchTool(other),
        }
    }
}

impl From<ArchiveError> for SyncError {
    fn from(e: ArchiveError) -> Self {
        SyncError::Archive(e)
    }
}

impl From<HashError> for SyncError {
    fn from(e: HashError) -> Self {
        SyncError::Local(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Local(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Comparing the ledger and local files against the published state.
    Checking,
    /// Wiping tracked files and installing the full content package.
    FullResync,
    /// Walking the diff chain version by version.
    Incremental,
}

/// How a finished run got the install to the target version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    UpToDate,
    Full,
    Incremental,
}

/// Progress and lifecycle notifications emitted during a run.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A run began; emitted before the service is first contacted.
    Started { run_id: Uuid },
    PhaseChanged(SyncPhase),
    /// Overall fraction in `[0, 1]`.
    Progress { fraction: f64 },
    /// The install is now uniformly at this version.
    VersionApplied { version: VersionId },
    Completed { version: VersionId },
    Cancelled,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub previous: Option<VersionId>,
    pub installed: VersionId,
    pub mode: SyncMode,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Rehash every tracked file during the consistency check rather than
    /// only checking existence.
    pub deep_verify: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { deep_verify: true }
    }
}

pub use engine::SyncEngine;
pub use remote::{HttpRemoteApi, RemoteApi};
pub use storage::{FileLedgerStore, LedgerStore, MemoryLedgerStore, VersionLedger};
