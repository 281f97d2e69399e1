pub mod archive;
pub mod cancel;
pub mod hashing;
pub mod net;
pub mod patcher;

// Re-exports for convenience
pub use archive::{ArchiveError, ArchiveExtractor, ExternalUnzip};
pub use cancel::{CancelRegistration, CancelScope, CancellableFuture, TaskFailure, TaskState};
pub use hashing::{file_md5, HashError, Hasher, Md5Hasher};
pub use net::broker::{BrokerError, EndpointSet, RequestBroker};
pub use net::{DownloadError, DownloadEvent, Downloader, HttpDownloader};
pub use patcher::{BinaryPatcher, ExternalPatcher, PatchError};
