use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::StreamExt;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_core::ledger::InstalledVersion;
use gantry_core::path_utils::GantryPath;
use gantry_core::{DiffEntryKind, VersionId};
use gantry_infra::archive::{ArchiveError, ArchiveExtractor};
use gantry_infra::cancel::{CancelScope, CancellableFuture};
use gantry_infra::hashing::Hasher;
use gantry_infra::net::broker::BrokerError;
use gantry_infra::net::{DownloadEvent, Downloader};
use gantry_infra::patcher::BinaryPatcher;

use crate::sync::remote::RemoteApi;
use crate::sync::storage::{LedgerStore, VersionLedger};
use crate::sync::{SyncError, SyncEvent, SyncMode, SyncOptions, SyncPhase, SyncReport};

/// Drives one install directory to the newest published version.
///
/// The engine owns its ledger and takes `&mut self` to run, so two
/// overlapping runs against the same install cannot be expressed; hosts
/// that want a background run move the engine into [`SyncEngine::spawn`].
pub struct SyncEngine {
    api: Arc<dyn RemoteApi>,
    downloader: Arc<dyn Downloader>,
    extractor: Arc<dyn ArchiveExtractor>,
    patcher: Arc<dyn BinaryPatcher>,
    hasher: Arc<dyn Hasher>,
    ledger: VersionLedger,
    install_root: Utf8PathBuf,
    options: SyncOptions,
    transfer_events: Option<Sender<DownloadEvent>>,
}

fn checkpoint(scope: &CancelScope) -> Result<(), SyncError> {
    if scope.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

async fn emit(events: &Option<Sender<SyncEvent>>, event: SyncEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

fn utf8_temp_root(dir: &tempfile::TempDir) -> Result<Utf8PathBuf, SyncError> {
    Utf8Path::from_path(dir.path())
        .map(Utf8Path::to_path_buf)
        .ok_or_else(|| SyncError::Local("non-UTF8 temporary directory".into()))
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn RemoteApi>,
        downloader: Arc<dyn Downloader>,
        extractor: Arc<dyn ArchiveExtractor>,
        patcher: Arc<dyn BinaryPatcher>,
        hasher: Arc<dyn Hasher>,
        ledger_store: Arc<dyn LedgerStore>,
        install_root: Utf8PathBuf,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let ledger = VersionLedger::load(ledger_store)?;
        Ok(Self {
            api,
            downloader,
            extractor,
            patcher,
            hasher,
            ledger,
            install_root,
            options,
            transfer_events: None,
        })
    }

    /// Forward byte-level transfer progress to `tx` (for UI throughput
    /// displays; distinct from the coarse [`SyncEvent::Progress`] fraction).
    pub fn with_transfer_events(mut self, tx: Sender<DownloadEvent>) -> Self {
        self.transfer_events = Some(tx);
        self
    }

    pub fn install_root(&self) -> &Utf8Path {
        &self.install_root
    }

    /// Version the install is uniformly at, if any.
    pub fn current_version(&self) -> Option<VersionId> {
        self.ledger.common_version()
    }

    /// Run to completion on the caller's task.
    pub async fn run(
        &mut self,
        scope: &CancelScope,
        events: Option<Sender<SyncEvent>>,
    ) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let result = self.run_inner(run_id, scope, &events).await;

        // A cancelled scope wins over whatever error the abort surfaced as.
        let result = match result {
            Err(_) if scope.is_cancelled() => Err(SyncError::Cancelled),
            other => other,
        };

        match &result {
            Ok(report) => {
                info!(run = %run_id, version = report.installed, "sync completed");
                emit(&events, SyncEvent::Completed { version: report.installed }).await;
            }
            Err(SyncError::Cancelled) => {
                info!(run = %run_id, "sync cancelled");
                emit(&events, SyncEvent::Cancelled).await;
            }
            Err(e) => {
                warn!(run = %run_id, "sync failed: {e}");
                emit(&events, SyncEvent::Failed { message: e.to_string() }).await;
            }
        }
        result
    }

    /// Move the engine onto the runtime; cancelling the returned handle
    /// (or `scope`) aborts the run.
    pub fn spawn(
        mut self,
        scope: CancelScope,
        events: Option<Sender<SyncEvent>>,
    ) -> CancellableFuture<SyncReport, SyncError> {
        let run_scope = scope.clone();
        CancellableFuture::spawn(scope, async move { self.run(&run_scope, events).await })
    }

    async fn run_inner(
        &mut self,
        run_id: Uuid,
        scope: &CancelScope,
        events: &Option<Sender<SyncEvent>>,
    ) -> Result<SyncReport, SyncError> {
        checkpoint(scope)?;
        emit(events, SyncEvent::Started { run_id }).await;

        let target = self
            .api
            .latest_version_id(scope)
            .await?
            .ok_or(SyncError::NothingPublished)?;

        emit(events, SyncEvent::PhaseChanged(SyncPhase::Checking)).await;

        let previous = self.ledger.common_version();
        info!(run = %run_id, target, current = ?previous, "starting sync");

        if let Some(current) = previous {
            if current <= target && self.is_consistent(current, scope).await? {
                if current == target {
                    emit(events, SyncEvent::Progress { fraction: 1.0 }).await;
                    return Ok(SyncReport {
                        run_id,
                        previous,
                        installed: target,
                        mode: SyncMode::UpToDate,
                    });
                }
                if self.diff_chain_available(current, target, scope).await? {
                    self.apply_diff_chain(current, target, scope, events).await?;
                    return Ok(SyncReport {
                        run_id,
                        previous,
                        installed: target,
                        mode: SyncMode::Incremental,
                    });
                }
                debug!("diff chain incomplete between {current} and {target}");
            }
        }

        self.full_resync(target, scope, events).await?;
        Ok(SyncReport {
            run_id,
            previous,
            installed: target,
            mode: SyncMode::Full,
        })
    }

    /// Whether the install matches the published content of `version`:
    /// same tracked paths, files present, hashes matching when deep
    /// verification is on.
    async fn is_consistent(
        &self,
        version: VersionId,
        scope: &CancelScope,
    ) -> Result<bool, SyncError> {
        let summary = match self.api.content_summary(version, scope).await {
            Ok(s) => s,
            // The installed version is no longer published; resync.
            Err(SyncError::Remote(BrokerError::ServerRejection(_))) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut expected: BTreeMap<String, String> = BTreeMap::new();
        for file in &summary.files {
            expected.insert(GantryPath::normalize(&file.path), file.hash.clone());
        }

        let tracked = self.ledger.all_paths();
        if tracked != expected.keys().cloned().collect::<BTreeSet<_>>() {
            return Ok(false);
        }

        for (rel, want) in expected {
            checkpoint(scope)?;
            let full = self.install_root.join(&rel);
            if !full.exists() {
                return Ok(false);
            }
            if self.options.deep_verify {
                let hasher = self.hasher.clone();
                let path = full.clone();
                let got = tokio::task::spawn_blocking(move || hasher.hash(&path))
                    .await
                    .map_err(|e| SyncError::Local(e.to_string()))??;
                if !got.eq_ignore_ascii_case(&want) {
                    debug!("hash mismatch for {rel}");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// A diff package must exist for every version between `from`
    /// (exclusive) and `target` (inclusive).
    async fn diff_chain_available(
        &self,
        from: VersionId,
        target: VersionId,
        scope: &CancelScope,
    ) -> Result<bool, SyncError> {
        let api = &self.api;
        let results: Vec<Result<gantry_core::AppVersion, SyncError>> =
            futures::stream::iter(from + 1..=target)
                .map(|id| async move { api.version(id, scope).await })
                .buffer_unordered(4)
                .collect()
                .await;

        for result in results {
            match result {
                Ok(meta) if meta.diff_guid.is_some() => {}
                Ok(_) => return Ok(false),
                // A withdrawn intermediate version breaks the chain.
                Err(SyncError::Remote(BrokerError::ServerRejection(_))) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    async fn download_package(
        &self,
        urls: &[String],
        dest: &Utf8Path,
        scope: &CancelScope,
    ) -> Result<(), SyncError> {
        if urls.is_empty() {
            return Err(SyncError::Api("no package download urls published".into()));
        }
        let mut last: Option<SyncError> = None;
        for url in urls {
            checkpoint(scope)?;
            match self
                .downloader
                .fetch_to_file(url, dest, self.transfer_events.clone(), scope)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let e = SyncError::from(e);
                    if matches!(e, SyncError::Cancelled) {
                        return Err(e);
                    }
                    warn!("package download from {url} failed: {e}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| SyncError::Api("no package download urls published".into())))
    }

    /// Wipe tracked files and install the full content package of `target`.
    ///
    /// Every entry is bracketed by ledger writes: the in-flight sentinel
    /// lands on disk before extraction starts, the real version only after
    /// it finished, so an interruption anywhere is detectable.
    async fn full_resync(
        &mut self,
        target: VersionId,
        scope: &CancelScope,
        events: &Option<Sender<SyncEvent>>,
    ) -> Result<(), SyncError> {
        emit(events, SyncEvent::PhaseChanged(SyncPhase::FullResync)).await;
        info!(target, "full resync");

        let urls = self.api.content_urls(target, scope).await?;
        let work = tempfile::tempdir()?;
        let work_root = utf8_temp_root(&work)?;
        let package = work_root.join("content.pkg");
        self.download_package(&urls, &package, scope).await?;

        for rel in self.ledger.all_paths() {
            checkpoint(scope)?;
            remove_if_present(&self.install_root.join(&rel)).await?;
            self.ledger.clear(&rel)?;
        }
        self.ledger.clear_all()?;

        let entries = self.extractor.entries(&package).await?;
        let total = entries.len().max(1) as f64;
        for (idx, entry) in entries.iter().enumerate() {
            checkpoint(scope)?;
            let rel = GantryPath::normalize(entry);
            if !GantryPath::verify_safe(&rel) {
                return Err(SyncError::Archive(ArchiveError::UnsafeEntry(rel)));
            }
            self.ledger.set(&rel, InstalledVersion::InFlight)?;
            self.extractor
                .extract(&package, &rel, &self.install_root)
                .await?;
            self.ledger.set(&rel, InstalledVersion::Version(target))?;
            emit(
                events,
                SyncEvent::Progress {
                    fraction: (idx + 1) as f64 / total,
                },
            )
            .await;
        }

        emit(events, SyncEvent::VersionApplied { version: target }).await;
        Ok(())
    }

    /// Apply the diff of every version from `from + 1` through `target`,
    /// leaving the ledger uniform after each step.
    async fn apply_diff_chain(
        &mut self,
        from: VersionId,
        target: VersionId,
        scope: &CancelScope,
        events: &Option<Sender<SyncEvent>>,
    ) -> Result<(), SyncError> {
        emit(events, SyncEvent::PhaseChanged(SyncPhase::Incremental)).await;
        let steps = (target - from) as f64;

        for (step_idx, next) in (from + 1..=target).enumerate() {
            checkpoint(scope)?;
            info!(version = next, "applying diff");

            let diff = self.api.diff_summary(next, scope).await?;
            let urls = self.api.diff_urls(next, scope).await?;

            let work = tempfile::tempdir()?;
            let work_root = utf8_temp_root(&work)?;
            let package = work_root.join("diff.pkg");
            self.download_package(&urls, &package, scope).await?;

            let entries: Vec<String> = self
                .extractor
                .entries(&package)
                .await?
                .iter()
                .map(|e| GantryPath::normalize(e))
                .collect();

            // Validate the whole package before any ledger mutation so an
            // inconsistent diff never leaves a half-applied step behind.
            for rel in &entries {
                if !GantryPath::verify_safe(rel) {
                    return Err(SyncError::Archive(ArchiveError::UnsafeEntry(rel.clone())));
                }
                if diff.classify(rel) == DiffEntryKind::Undeclared {
                    return Err(SyncError::InconsistentPackage(format!(
                        "entry {rel} not declared by the version {next} diff"
                    )));
                }
            }

            let total = (entries.len() + diff.removed_files.len()).max(1) as f64;
            let mut done = 0usize;
            let progress = |done: usize| SyncEvent::Progress {
                fraction: (step_idx as f64 + done as f64 / total) / steps,
            };

            for rel in &entries {
                checkpoint(scope)?;
                match diff.classify(rel) {
                    DiffEntryKind::Added => {
                        self.ledger.set(rel, InstalledVersion::InFlight)?;
                        self.extractor
                            .extract(&package, rel, &self.install_root)
                            .await?;
                        self.ledger.set(rel, InstalledVersion::Version(next))?;
                    }
                    DiffEntryKind::Modified => {
                        self.apply_patch(&package, rel, next, &work_root, scope)
                            .await?;
                    }
                    DiffEntryKind::Undeclared => {
                        return Err(SyncError::InconsistentPackage(format!(
                            "entry {rel} not declared by the version {next} diff"
                        )));
                    }
                }
                done += 1;
                emit(events, progress(done)).await;
            }

            for removed in &diff.removed_files {
                checkpoint(scope)?;
                let rel = GantryPath::normalize(removed);
                if !GantryPath::verify_safe(&rel) {
                    return Err(SyncError::Archive(ArchiveError::UnsafeEntry(rel)));
                }
                remove_if_present(&self.install_root.join(&rel)).await?;
                self.ledger.clear(&rel)?;
                done += 1;
                emit(events, progress(done)).await;
            }

            // Files the diff did not touch are still valid for `next`.
            self.ledger.retag(next - 1, next)?;

            emit(events, SyncEvent::VersionApplied { version: next }).await;
            emit(
                events,
                SyncEvent::Progress {
                    fraction: (step_idx + 1) as f64 / steps,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Patch one modified file: extract the delta into the work dir, run
    /// the external tool into a sibling temp path, then rename over the
    /// original so the replacement is atomic.
    async fn apply_patch(
        &mut self,
        package: &Utf8Path,
        rel: &str,
        next: VersionId,
        work_root: &Utf8Path,
        scope: &CancelScope,
    ) -> Result<(), SyncError> {
        let original = self.install_root.join(rel);
        self.ledger.set(rel, InstalledVersion::InFlight)?;

        let delta = self.extractor.extract(package, rel, work_root).await?;
        let patched = Utf8PathBuf::from(format!("{original}.apply"));
        self.patcher
            .apply(&original, &delta, &patched, scope)
            .await?;
        tokio::fs::rename(patched.as_std_path(), original.as_std_path()).await?;

        self.ledger.set(rel, InstalledVersion::Version(next))?;
        Ok(())
    }
}

async fn remove_if_present(path: &Utf8Path) -> Result<(), SyncError> {
    match tokio::fs::remove_file(path.as_std_path()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::from(e)),
    }
}
