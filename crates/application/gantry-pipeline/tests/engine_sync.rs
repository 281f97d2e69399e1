use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc::Sender;

use gantry_core::ledger::InstalledVersion;
use gantry_core::{AppVersion, ContentFile, ContentSummary, DiffSummary, VersionId};
use gantry_infra::archive::{ArchiveError, ArchiveExtractor};
use gantry_infra::cancel::CancelScope;
use gantry_infra::hashing::Md5Hasher;
use gantry_infra::net::broker::BrokerError;
use gantry_infra::net::{DownloadError, DownloadEvent, Downloader};
use gantry_infra::patcher::{BinaryPatcher, PatchError};
use gantry_pipeline::sync::storage::{FileLedgerStore, LedgerStore, VersionLedger};
use gantry_pipeline::sync::{
    RemoteApi, SyncEngine, SyncError, SyncEvent, SyncMode, SyncOptions,
};

// ---- fake collaborators ---------------------------------------------------

#[derive(Default)]
struct FakeApi {
    latest: Option<VersionId>,
    versions: HashMap<VersionId, AppVersion>,
    content: HashMap<VersionId, ContentSummary>,
    diffs: HashMap<VersionId, DiffSummary>,
    content_urls: HashMap<VersionId, Vec<String>>,
    diff_urls: HashMap<VersionId, Vec<String>>,
}

fn not_found() -> SyncError {
    SyncError::Remote(BrokerError::ServerRejection(404))
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn latest_version_id(
        &self,
        _scope: &CancelScope,
    ) -> Result<Option<VersionId>, SyncError> {
        Ok(self.latest)
    }

    async fn latest_version(
        &self,
        _scope: &CancelScope,
    ) -> Result<Option<AppVersion>, SyncError> {
        Ok(self.latest.and_then(|id| self.versions.get(&id).cloned()))
    }

    async fn version(
        &self,
        id: VersionId,
        _scope: &CancelScope,
    ) -> Result<AppVersion, SyncError> {
        self.versions.get(&id).cloned().ok_or_else(not_found)
    }

    async fn versions(&self, _scope: &CancelScope) -> Result<Vec<AppVersion>, SyncError> {
        Ok(self.versions.values().cloned().collect())
    }

    async fn content_summary(
        &self,
        id: VersionId,
        _scope: &CancelScope,
    ) -> Result<ContentSummary, SyncError> {
        self.content.get(&id).cloned().ok_or_else(not_found)
    }

    async fn diff_summary(
        &self,
        id: VersionId,
        _scope: &CancelScope,
    ) -> Result<DiffSummary, SyncError> {
        self.diffs.get(&id).cloned().ok_or_else(not_found)
    }

    async fn content_urls(
        &self,
        id: VersionId,
        _scope: &CancelScope,
    ) -> Result<Vec<String>, SyncError> {
        self.content_urls.get(&id).cloned().ok_or_else(not_found)
    }

    async fn diff_urls(
        &self,
        id: VersionId,
        _scope: &CancelScope,
    ) -> Result<Vec<String>, SyncError> {
        self.diff_urls.get(&id).cloned().ok_or_else(not_found)
    }

    async fn content_torrent_url(
        &self,
        _id: VersionId,
        _scope: &CancelScope,
    ) -> Result<String, SyncError> {
        Err(SyncError::Api("torrents not served by fake".into()))
    }

    async fn diff_torrent_url(
        &self,
        _id: VersionId,
        _scope: &CancelScope,
    ) -> Result<String, SyncError> {
        Err(SyncError::Api("torrents not served by fake".into()))
    }
}

#[derive(Default)]
struct FakeDownloader {
    files: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Utf8Path,
        _progress: Option<Sender<DownloadEvent>>,
        _scope: &CancelScope,
    ) -> Result<(), DownloadError> {
        let bytes = self.files.get(url).ok_or(DownloadError::Status(404))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent.as_std_path()).await?;
        }
        tokio::fs::write(dest.as_std_path(), bytes).await?;
        Ok(())
    }

    async fn fetch_text(&self, _url: &str, _scope: &CancelScope) -> Result<String, DownloadError> {
        Err(DownloadError::Status(404))
    }
}

/// Test package format: a JSON object of entry path to file contents.
struct JsonArchive;

async fn read_package(package: &Utf8Path) -> Result<BTreeMap<String, String>, ArchiveError> {
    let data = tokio::fs::read(package.as_std_path()).await?;
    serde_json::from_slice(&data).map_err(|e| ArchiveError::ToolFailed(e.to_string()))
}

#[async_trait]
impl ArchiveExtractor for JsonArchive {
    async fn entries(&self, package: &Utf8Path) -> Result<Vec<String>, ArchiveError> {
        Ok(read_package(package).await?.keys().cloned().collect())
    }

    async fn extract(
        &self,
        package: &Utf8Path,
        entry: &str,
        dest_root: &Utf8Path,
    ) -> Result<Utf8PathBuf, ArchiveError> {
        let map = read_package(package).await?;
        let contents = map
            .get(entry)
            .ok_or_else(|| ArchiveError::ToolFailed(format!("no entry {entry}")))?;
        let dest = dest_root.join(entry);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent.as_std_path()).await?;
        }
        tokio::fs::write(dest.as_std_path(), contents).await?;
        Ok(dest)
    }
}

/// Cancels the run's scope and then fails, the way an aborted connection
/// surfaces as a transport error after the user hit cancel.
struct AbortiveDownloader;

#[async_trait]
impl Downloader for AbortiveDownloader {
    async fn fetch_to_file(
        &self,
        _url: &str,
        _dest: &Utf8Path,
        _progress: Option<Sender<DownloadEvent>>,
        scope: &CancelScope,
    ) -> Result<(), DownloadError> {
        scope.cancel();
        Err(DownloadError::Http("connection reset".into()))
    }

    async fn fetch_text(&self, _url: &str, _scope: &CancelScope) -> Result<String, DownloadError> {
        Err(DownloadError::Status(404))
    }
}

/// The "patched" file is simply the delta's contents.
struct CopyPatcher;

#[async_trait]
impl BinaryPatcher for CopyPatcher {
    async fn apply(
        &self,
        original: &Utf8Path,
        delta: &Utf8Path,
        output: &Utf8Path,
        _scope: &CancelScope,
    ) -> Result<(), PatchError> {
        if !original.exists() {
            return Err(PatchError::ToolFailed(format!("missing original {original}")));
        }
        tokio::fs::copy(delta.as_std_path(), output.as_std_path()).await?;
        Ok(())
    }
}

// ---- helpers --------------------------------------------------------------

fn package(entries: &[(&str, &str)]) -> Vec<u8> {
    let map: BTreeMap<&str, &str> = entries.iter().copied().collect();
    serde_json::to_vec(&map).unwrap()
}

fn meta(id: VersionId, has_diff: bool) -> AppVersion {
    AppVersion {
        id,
        label: format!("1.0.{id}"),
        changelog: String::new(),
        publish_time: 1_700_000_000 + id as i64,
        content_guid: format!("content-{id}"),
        diff_guid: has_diff.then(|| format!("diff-{id}")),
        draft: false,
    }
}

fn summary(files: &[(&str, &str)]) -> ContentSummary {
    ContentSummary {
        size: 0,
        encryption_method: "none".into(),
        compression_method: "zip".into(),
        files: files
            .iter()
            .map(|(path, hash)| ContentFile {
                path: (*path).into(),
                hash: (*hash).into(),
            })
            .collect(),
    }
}

fn diff(added: &[&str], modified: &[&str], removed: &[&str]) -> DiffSummary {
    DiffSummary {
        size: 0,
        encryption_method: "none".into(),
        compression_method: "zip".into(),
        added_files: added.iter().map(|s| s.to_string()).collect(),
        modified_files: modified.iter().map(|s| s.to_string()).collect(),
        removed_files: removed.iter().map(|s| s.to_string()).collect(),
    }
}

fn install_root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

fn preset_ledger(root: &Utf8Path, entries: &[(&str, InstalledVersion)]) {
    let store: Arc<dyn LedgerStore> = Arc::new(FileLedgerStore::new(root));
    let mut ledger = VersionLedger::load(store).unwrap();
    for (path, version) in entries {
        ledger.set(path, *version).unwrap();
    }
}

fn reload_ledger(root: &Utf8Path) -> VersionLedger {
    VersionLedger::load(Arc::new(FileLedgerStore::new(root))).unwrap()
}

fn build_engine(
    root: &Utf8Path,
    api: FakeApi,
    downloader: FakeDownloader,
    deep_verify: bool,
) -> SyncEngine {
    SyncEngine::new(
        Arc::new(api),
        Arc::new(downloader),
        Arc::new(JsonArchive),
        Arc::new(CopyPatcher),
        Arc::new(Md5Hasher),
        Arc::new(FileLedgerStore::new(root)),
        root.to_path_buf(),
        SyncOptions { deep_verify },
    )
    .unwrap()
}

fn read(root: &Utf8Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel).as_std_path()).unwrap()
}

async fn run_collecting(
    engine: &mut SyncEngine,
    scope: &CancelScope,
) -> (Result<gantry_pipeline::SyncReport, SyncError>, Vec<SyncEvent>) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let result = engine.run(scope, Some(tx)).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (result, events)
}

// ---- scenarios ------------------------------------------------------------

#[tokio::test]
async fn empty_install_gets_a_full_resync() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);

    let mut api = FakeApi {
        latest: Some(3),
        ..Default::default()
    };
    api.content.insert(3, summary(&[("a.bin", "X"), ("sub/b.bin", "Y")]));
    api.content_urls
        .insert(3, vec!["http://pkg/content-3".into()]);

    let mut downloader = FakeDownloader::default();
    downloader.files.insert(
        "http://pkg/content-3".into(),
        package(&[("a.bin", "alpha-3"), ("sub/b.bin", "beta-3")]),
    );

    let mut engine = build_engine(&root, api, downloader, false);
    let (result, events) = run_collecting(&mut engine, &CancelScope::new()).await;

    let report = result.unwrap();
    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(report.previous, None);
    assert_eq!(report.installed, 3);

    assert_eq!(read(&root, "a.bin"), "alpha-3");
    assert_eq!(read(&root, "sub/b.bin"), "beta-3");
    assert_eq!(reload_ledger(&root).common_version(), Some(3));

    assert!(matches!(events.first(), Some(SyncEvent::Started { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Completed { version: 3 })));
    // Progress fractions stay inside [0, 1].
    for event in &events {
        if let SyncEvent::Progress { fraction } = event {
            assert!((0.0..=1.0).contains(fraction), "fraction {fraction}");
        }
    }
}

#[tokio::test]
async fn consistent_install_at_latest_is_up_to_date() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);
    std::fs::write(root.join("a.bin").as_std_path(), "alpha").unwrap();
    preset_ledger(&root, &[("a.bin", InstalledVersion::Version(3))]);

    let mut api = FakeApi {
        latest: Some(3),
        ..Default::default()
    };
    api.content.insert(3, summary(&[("a.bin", "X")]));

    // No urls and no packages: any download attempt would fail the test.
    let mut engine = build_engine(&root, api, FakeDownloader::default(), false);
    let report = engine.run(&CancelScope::new(), None).await.unwrap();

    assert_eq!(report.mode, SyncMode::UpToDate);
    assert_eq!(read(&root, "a.bin"), "alpha");
}

#[tokio::test]
async fn hash_mismatch_forces_a_full_resync() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);
    std::fs::write(root.join("a.bin").as_std_path(), "tampered").unwrap();
    preset_ledger(&root, &[("a.bin", InstalledVersion::Version(1))]);

    let mut api = FakeApi {
        latest: Some(1),
        ..Default::default()
    };
    api.content
        .insert(1, summary(&[("a.bin", "00000000000000000000000000000000")]));
    api.content_urls
        .insert(1, vec!["http://pkg/content-1".into()]);

    let mut downloader = FakeDownloader::default();
    downloader
        .files
        .insert("http://pkg/content-1".into(), package(&[("a.bin", "clean")]));

    let mut engine = build_engine(&root, api, downloader, true);
    let report = engine.run(&CancelScope::new(), None).await.unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(read(&root, "a.bin"), "clean");
}

#[tokio::test]
async fn in_flight_sentinel_from_interrupted_run_forces_full_resync() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);
    std::fs::write(root.join("a.bin").as_std_path(), "half").unwrap();
    preset_ledger(
        &root,
        &[
            ("a.bin", InstalledVersion::Version(2)),
            ("b.bin", InstalledVersion::InFlight),
        ],
    );

    let mut api = FakeApi {
        latest: Some(2),
        ..Default::default()
    };
    api.content.insert(2, summary(&[("a.bin", "X"), ("b.bin", "Y")]));
    api.content_urls
        .insert(2, vec!["http://pkg/content-2".into()]);

    let mut downloader = FakeDownloader::default();
    downloader.files.insert(
        "http://pkg/content-2".into(),
        package(&[("a.bin", "whole-a"), ("b.bin", "whole-b")]),
    );

    let mut engine = build_engine(&root, api, downloader, false);
    let report = engine.run(&CancelScope::new(), None).await.unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(read(&root, "a.bin"), "whole-a");
    assert_eq!(read(&root, "b.bin"), "whole-b");
    assert_eq!(reload_ledger(&root).common_version(), Some(2));
}

#[tokio::test]
async fn diff_chain_applies_adds_patches_removes_and_bumps_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);
    std::fs::write(root.join("a.bin").as_std_path(), "a-v1").unwrap();
    std::fs::write(root.join("b.bin").as_std_path(), "b-v1").unwrap();
    std::fs::write(root.join("keep.bin").as_std_path(), "keep").unwrap();
    preset_ledger(
        &root,
        &[
            ("a.bin", InstalledVersion::Version(1)),
            ("b.bin", InstalledVersion::Version(1)),
            ("keep.bin", InstalledVersion::Version(1)),
        ],
    );

    let mut api = FakeApi {
        latest: Some(3),
        ..Default::default()
    };
    api.content.insert(
        1,
        summary(&[("a.bin", "X"), ("b.bin", "Y"), ("keep.bin", "Z")]),
    );
    api.versions.insert(2, meta(2, true));
    api.versions.insert(3, meta(3, true));

    // v2: adds c.bin, patches a.bin, removes b.bin.
    api.diffs.insert(2, diff(&["c.bin"], &["a.bin"], &["b.bin"]));
    api.diff_urls.insert(2, vec!["http://pkg/diff-2".into()]);
    // v3: patches c.bin only; a.bin and keep.bin ride along untouched.
    api.diffs.insert(3, diff(&[], &["c.bin"], &[]));
    api.diff_urls.insert(3, vec!["http://pkg/diff-3".into()]);

    let mut downloader = FakeDownloader::default();
    downloader.files.insert(
        "http://pkg/diff-2".into(),
        package(&[("c.bin", "c-v2"), ("a.bin", "a-v2")]),
    );
    downloader
        .files
        .insert("http://pkg/diff-3".into(), package(&[("c.bin", "c-v3")]));

    let mut engine = build_engine(&root, api, downloader, false);
    let (result, events) = run_collecting(&mut engine, &CancelScope::new()).await;

    let report = result.unwrap();
    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.previous, Some(1));
    assert_eq!(report.installed, 3);

    assert_eq!(read(&root, "a.bin"), "a-v2");
    assert_eq!(read(&root, "c.bin"), "c-v3");
    assert_eq!(read(&root, "keep.bin"), "keep");
    assert!(!root.join("b.bin").exists());

    let ledger = reload_ledger(&root);
    assert_eq!(ledger.common_version(), Some(3));
    assert_eq!(ledger.get("b.bin"), None);

    let applied: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::VersionApplied { version } => Some(*version),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec![2, 3]);
}

#[tokio::test]
async fn missing_diff_guid_in_the_chain_falls_back_to_full_resync() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);
    std::fs::write(root.join("a.bin").as_std_path(), "a-v1").unwrap();
    preset_ledger(&root, &[("a.bin", InstalledVersion::Version(1))]);

    let mut api = FakeApi {
        latest: Some(2),
        ..Default::default()
    };
    api.content.insert(1, summary(&[("a.bin", "X")]));
    api.versions.insert(2, meta(2, false));
    api.content.insert(2, summary(&[("a.bin", "X2")]));
    api.content_urls
        .insert(2, vec!["http://pkg/content-2".into()]);

    let mut downloader = FakeDownloader::default();
    downloader
        .files
        .insert("http://pkg/content-2".into(), package(&[("a.bin", "a-v2")]));

    let mut engine = build_engine(&root, api, downloader, false);
    let report = engine.run(&CancelScope::new(), None).await.unwrap();

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(read(&root, "a.bin"), "a-v2");
}

#[tokio::test]
async fn undeclared_package_entry_aborts_before_any_ledger_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);
    std::fs::write(root.join("a.bin").as_std_path(), "a-v1").unwrap();
    preset_ledger(&root, &[("a.bin", InstalledVersion::Version(1))]);

    let mut api = FakeApi {
        latest: Some(2),
        ..Default::default()
    };
    api.content.insert(1, summary(&[("a.bin", "X")]));
    api.versions.insert(2, meta(2, true));
    api.diffs.insert(2, diff(&["x.bin"], &[], &[]));
    api.diff_urls.insert(2, vec!["http://pkg/diff-2".into()]);

    let mut downloader = FakeDownloader::default();
    // y.bin is not declared in any of the diff's path sets.
    downloader.files.insert(
        "http://pkg/diff-2".into(),
        package(&[("x.bin", "x"), ("y.bin", "y")]),
    );

    let mut engine = build_engine(&root, api, downloader, false);
    let err = engine.run(&CancelScope::new(), None).await.unwrap_err();

    assert!(matches!(err, SyncError::InconsistentPackage(_)));
    // The ledger was not touched: still uniformly at version 1.
    assert_eq!(reload_ledger(&root).common_version(), Some(1));
    assert!(!root.join("x.bin").exists());
}

#[tokio::test]
async fn no_published_version_is_reported_as_such() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);

    let api = FakeApi {
        latest: None,
        ..Default::default()
    };
    let mut engine = build_engine(&root, api, FakeDownloader::default(), false);
    let (result, events) = run_collecting(&mut engine, &CancelScope::new()).await;
    assert!(matches!(result, Err(SyncError::NothingPublished)));

    // Started precedes the first service call, so it is seen even though
    // the run failed straight away.
    assert!(matches!(events.first(), Some(SyncEvent::Started { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Failed { .. })));
}

#[tokio::test]
async fn cancelled_scope_short_circuits_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);

    let api = FakeApi {
        latest: Some(1),
        ..Default::default()
    };
    let mut engine = build_engine(&root, api, FakeDownloader::default(), false);

    let scope = CancelScope::new();
    scope.cancel();
    let (result, events) = run_collecting(&mut engine, &scope).await;

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::Cancelled)));
}

#[tokio::test]
async fn cancellation_mid_run_wins_over_the_surfaced_error() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);

    let mut api = FakeApi {
        latest: Some(1),
        ..Default::default()
    };
    api.content.insert(1, summary(&[("a.bin", "X")]));
    api.content_urls
        .insert(1, vec!["http://pkg/content-1".into()]);

    let mut engine = SyncEngine::new(
        Arc::new(api),
        Arc::new(AbortiveDownloader),
        Arc::new(JsonArchive),
        Arc::new(CopyPatcher),
        Arc::new(Md5Hasher),
        Arc::new(FileLedgerStore::new(&root)),
        root.clone(),
        SyncOptions { deep_verify: false },
    )
    .unwrap();

    let scope = CancelScope::new();
    let (result, events) = run_collecting(&mut engine, &scope).await;

    // The download's transport error must not mask the cancellation.
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::Cancelled)));
    assert!(!events.iter().any(|e| matches!(e, SyncEvent::Failed { .. })));
}

#[tokio::test]
async fn spawned_engine_reports_through_the_handle() {
    let dir = tempfile::tempdir().unwrap();
    let root = install_root(&dir);

    let mut api = FakeApi {
        latest: Some(1),
        ..Default::default()
    };
    api.content.insert(1, summary(&[("a.bin", "X")]));
    api.content_urls
        .insert(1, vec!["http://pkg/content-1".into()]);

    let mut downloader = FakeDownloader::default();
    downloader
        .files
        .insert("http://pkg/content-1".into(), package(&[("a.bin", "a")]));

    let engine = build_engine(&root, api, downloader, false);
    let handle = engine.spawn(CancelScope::new(), None);
    let report = handle.outcome().await.unwrap();
    assert_eq!(report.installed, 1);
    assert_eq!(read(&root, "a.bin"), "a");
}
