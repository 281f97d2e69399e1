use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::process::Command;

use gantry_core::path_utils::GantryPath;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive tool not available: {0}")]
    ToolMissing(String),
    #[error("archive tool exited with status {0}")]
    ToolFailed(String),
    #[error("unsafe entry path: {0}")]
    UnsafeEntry(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Archive collaborator. The package format itself is outside this crate;
/// the engine only needs entry enumeration and per-entry extraction so it
/// can bracket each entry with ledger writes.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Relative paths of all file entries in the package.
    async fn entries(&self, package: &Utf8Path) -> Result<Vec<String>, ArchiveError>;

    /// Extract a single entry under `dest_root`, returning its on-disk path.
    async fn extract(
        &self,
        package: &Utf8Path,
        entry: &str,
        dest_root: &Utf8Path,
    ) -> Result<Utf8PathBuf, ArchiveError>;
}

/// Shells out to the system `unzip` binary.
pub struct ExternalUnzip;

impl ExternalUnzip {
    async fn run(program: &str, args: &[&str]) -> Result<std::process::Output, ArchiveError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ArchiveError::ToolMissing(program.to_string())
                } else {
                    ArchiveError::Io(e)
                }
            })?;
        if !output.status.success() {
            return Err(ArchiveError::ToolFailed(output.status.to_string()));
        }
        Ok(output)
    }
}

#[async_trait]
impl ArchiveExtractor for ExternalUnzip {
    async fn entries(&self, package: &Utf8Path) -> Result<Vec<String>, ArchiveError> {
        let output = Self::run("unzip", &["-Z1", package.as_str()]).await?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.ends_with('/'))
            .map(GantryPath::normalize)
            .collect())
    }

    async fn extract(
        &self,
        package: &Utf8Path,
        entry: &str,
        dest_root: &Utf8Path,
    ) -> Result<Utf8PathBuf, ArchiveError> {
        if !GantryPath::verify_safe(entry) {
            return Err(ArchiveError::UnsafeEntry(entry.to_string()));
        }
        Self::run(
            "unzip",
            &[
                "-qq",
                "-o",
                package.as_str(),
                entry,
                "-d",
                dest_root.as_str(),
            ],
        )
        .await?;
        Ok(dest_root.join(entry))
    }
}
