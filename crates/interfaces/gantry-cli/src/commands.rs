use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use chrono::DateTime;
use humansize::{format_size, DECIMAL};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::Url;

use gantry_config::{clamp_stagger, DEFAULT_DOWNLOAD_RETRIES, DEFAULT_PATCH_COMMAND};
use gantry_core::ledger::InstalledVersion;
use gantry_infra::archive::ExternalUnzip;
use gantry_infra::cancel::{CancelScope, TaskFailure};
use gantry_infra::hashing::Md5Hasher;
use gantry_infra::net::broker::EndpointSet;
use gantry_infra::net::HttpDownloader;
use gantry_infra::patcher::ExternalPatcher;
use gantry_pipeline::sync::{
    FileLedgerStore, HttpRemoteApi, LedgerStore, RemoteApi, SyncEngine, SyncEvent, SyncMode,
    SyncOptions, SyncPhase,
};
use gantry_pipeline::ProgressTracker;

use crate::ApiArgs;

fn build_api(args: &ApiArgs) -> Result<HttpRemoteApi> {
    let client = gantry_infra::net::default_http_client().context("Failed to build HTTP client")?;
    let primary = Url::parse(&args.api_url)
        .with_context(|| format!("invalid API url {}", args.api_url))?;
    let mirrors = args
        .mirrors
        .iter()
        .map(|m| Url::parse(m).with_context(|| format!("invalid mirror url {m}")))
        .collect::<Result<Vec<_>>>()?;
    let stagger = clamp_stagger(Duration::from_millis(args.stagger_ms));
    let endpoints = EndpointSet::new(primary, mirrors, stagger);
    Ok(HttpRemoteApi::from_client(
        client,
        endpoints,
        args.secret.clone(),
    ))
}

/// A scope that is cancelled on the first Ctrl-C.
fn interruptible_scope() -> CancelScope {
    let scope = CancelScope::new();
    let handler_scope = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n:: Interrupt received, stopping...");
            handler_scope.cancel();
        }
    });
    scope
}

pub async fn cmd_latest(api_args: ApiArgs) -> Result<()> {
    let api = build_api(&api_args)?;
    let scope = interruptible_scope();

    let Some(version) = api.latest_version(&scope).await? else {
        println!(":: No version has been published yet.");
        return Ok(());
    };
    let summary = api.content_summary(version.id, &scope).await?;

    let published = DateTime::from_timestamp(version.publish_time, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| version.publish_time.to_string());

    println!(":: Latest published version");
    println!("   Id:        {}", version.id);
    println!("   Label:     {}", version.label);
    println!("   Published: {published}");
    println!("   Files:     {}", summary.files.len());
    println!(
        "   Size:      {}",
        format_size(summary.size.max(0) as u64, DECIMAL)
    );
    println!(
        "   Delta:     {}",
        if version.diff_guid.is_some() {
            "available"
        } else {
            "full package only"
        }
    );
    if !version.changelog.is_empty() {
        println!("\n{}", version.changelog);
    }
    Ok(())
}

pub fn cmd_status(path: Utf8PathBuf) -> Result<()> {
    let store = FileLedgerStore::new(&path);
    let ledger = store.load().map_err(|e| anyhow::anyhow!("{e}"))?;

    println!(":: Install status");
    println!("   Path:          {path}");
    println!("   Tracked files: {}", ledger.len());

    if ledger.is_empty() {
        println!("   Version:       none (never synced)");
        return Ok(());
    }

    match ledger.common_version() {
        Some(version) => println!("   Version:       {version}"),
        None => {
            let interrupted = ledger
                .all_paths()
                .iter()
                .any(|p| ledger.get(p) == Some(InstalledVersion::InFlight));
            if interrupted {
                println!("   Version:       interrupted sync (run `sync` to repair)");
            } else {
                println!("   Version:       mixed (run `sync` to repair)");
            }
        }
    }
    Ok(())
}

pub async fn cmd_sync(
    api_args: ApiArgs,
    path: Utf8PathBuf,
    limit_mb: Option<u64>,
    patch_cmd: Option<String>,
    shallow: bool,
) -> Result<()> {
    println!(":: Synchronizing");
    println!("   Target: {path}");

    let api = build_api(&api_args)?;
    let client = gantry_infra::net::default_http_client().context("Failed to build HTTP client")?;
    let downloader = HttpDownloader::new(
        client,
        DEFAULT_DOWNLOAD_RETRIES,
        limit_mb.map(|mb| mb * 1024 * 1024),
    );
    let patcher =
        ExternalPatcher::new(patch_cmd.unwrap_or_else(|| DEFAULT_PATCH_COMMAND.to_string()));

    let (transfer_tx, mut transfer_rx) = tokio::sync::mpsc::channel(100);
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(100);

    let engine = SyncEngine::new(
        Arc::new(api),
        Arc::new(downloader),
        Arc::new(ExternalUnzip),
        Arc::new(patcher),
        Arc::new(Md5Hasher),
        Arc::new(FileLedgerStore::new(&path)),
        path,
        SyncOptions {
            deep_verify: !shallow,
        },
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?
    .with_transfer_events(transfer_tx);

    let scope = interruptible_scope();
    let handle = engine.spawn(scope, Some(event_tx));

    let bars = MultiProgress::new();
    let pb_main = bars.add(ProgressBar::new(100));
    pb_main.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg}")
            .expect("static template")
            .progress_chars("=>-"),
    );
    pb_main.set_message("Checking...");

    let pb_bytes = bars.add(ProgressBar::new_spinner());
    pb_bytes.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("static template"),
    );
    pb_bytes.enable_steady_tick(Duration::from_millis(200));

    let byte_bar = pb_bytes.clone();
    let transfer_task = tokio::spawn(async move {
        let mut tracker = ProgressTracker::new();
        while let Some(event) = transfer_rx.recv().await {
            tracker.update(event);
            let snap = tracker.snapshot();
            byte_bar.set_message(format!(
                "{} / {} ({}/s)",
                format_size(snap.downloaded_bytes, DECIMAL),
                format_size(snap.total_bytes, DECIMAL),
                format_size(snap.speed_bps, DECIMAL),
            ));
        }
    });

    while let Some(event) = event_rx.recv().await {
        match event {
            SyncEvent::Started { .. } => {
                pb_main.set_message("Contacting service...");
            }
            SyncEvent::PhaseChanged(phase) => {
                pb_main.set_message(describe_phase(phase).to_string());
            }
            SyncEvent::Progress { fraction } => {
                pb_main.set_position((fraction.clamp(0.0, 1.0) * 100.0).round() as u64);
            }
            SyncEvent::VersionApplied { version } => {
                pb_main.println(format!(":: Now at version {version}"));
            }
            SyncEvent::Completed { .. } | SyncEvent::Cancelled | SyncEvent::Failed { .. } => {}
        }
    }

    let outcome = handle.outcome().await;
    transfer_task.abort();
    pb_bytes.finish_and_clear();

    match outcome {
        Ok(report) => {
            pb_main.finish_with_message("Sync complete");
            let how = match report.mode {
                SyncMode::UpToDate => "already up to date",
                SyncMode::Incremental => "updated incrementally",
                SyncMode::Full => "fully resynchronized",
            };
            println!("\n:: Version {} installed ({how})", report.installed);
            Ok(())
        }
        Err(TaskFailure::Cancelled) => {
            pb_main.abandon_with_message("Cancelled");
            anyhow::bail!("sync cancelled");
        }
        Err(TaskFailure::Error(e)) => {
            pb_main.abandon_with_message("Failed");
            Err(anyhow::anyhow!("{e}"))
        }
        Err(TaskFailure::Panic(msg)) => {
            pb_main.abandon_with_message("Failed");
            anyhow::bail!("sync worker panicked: {msg}");
        }
    }
}

fn describe_phase(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::Checking => "Checking local state...",
        SyncPhase::FullResync => "Installing full package...",
        SyncPhase::Incremental => "Applying updates...",
    }
}
