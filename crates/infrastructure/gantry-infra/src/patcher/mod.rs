use async_trait::async_trait;
use camino::Utf8Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::cancel::CancelScope;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch tool not available: {0}")]
    ToolMissing(String),
    #[error("patch tool exited with status {0}")]
    ToolFailed(String),
    #[error("invalid patch command template: {0}")]
    Template(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

/// Binary-diff collaborator: produces `output` by applying `delta` to
/// `original`. Implemented by invoking an external tool.
#[async_trait]
pub trait BinaryPatcher: Send + Sync {
    async fn apply(
        &self,
        original: &Utf8Path,
        delta: &Utf8Path,
        output: &Utf8Path,
        scope: &CancelScope,
    ) -> Result<(), PatchError>;
}

/// Runs a configurable command template such as
/// `xdelta3 -d -f -s {original} {delta} {output}`.
pub struct ExternalPatcher {
    template: String,
}

impl ExternalPatcher {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    fn resolve_command(
        &self,
        original: &Utf8Path,
        delta: &Utf8Path,
        output: &Utf8Path,
    ) -> Result<(String, Vec<String>), PatchError> {
        let rendered = self
            .template
            .replace("{original}", original.as_str())
            .replace("{delta}", delta.as_str())
            .replace("{output}", output.as_str());

        let parts =
            shlex::split(&rendered).ok_or_else(|| PatchError::Template(rendered.clone()))?;
        let mut iter = parts.into_iter();
        let program = iter
            .next()
            .ok_or_else(|| PatchError::Template(rendered.clone()))?;
        Ok((program, iter.collect()))
    }
}

#[async_trait]
impl BinaryPatcher for ExternalPatcher {
    async fn apply(
        &self,
        original: &Utf8Path,
        delta: &Utf8Path,
        output: &Utf8Path,
        scope: &CancelScope,
    ) -> Result<(), PatchError> {
        let (program, args) = self.resolve_command(original, delta, output)?;
        debug!("applying delta: {program} {args:?}");

        let mut child = Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PatchError::ToolMissing(program.clone())
                } else {
                    PatchError::Io(e)
                }
            })?;

        let status = tokio::select! {
            _ = scope.cancelled() => {
                let _ = child.kill().await;
                return Err(PatchError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(PatchError::ToolFailed(status.to_string()));
        }
        Ok(())
    }
}
