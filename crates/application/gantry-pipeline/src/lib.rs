pub mod sync;
pub mod tracker;

// Re-export the pieces hosts typically need
pub use sync::{
    FileLedgerStore, HttpRemoteApi, LedgerStore, MemoryLedgerStore, RemoteApi, SyncEngine,
    SyncError, SyncEvent, SyncMode, SyncOptions, SyncPhase, SyncReport, VersionLedger,
};
pub use tracker::{ProgressTracker, TransferSnapshot};
