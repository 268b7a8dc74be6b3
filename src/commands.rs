use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

use mediafetch::{
    DirCacheStore, DownloadEvent, DownloadHandle, DownloadRegistry, EngineConfig, EnqueueOptions, ExtraInfo,
    LocalFileStore,
};

use crate::cli::DownloadItem;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct RunOptions {
    pub cache_dir: PathBuf,
    pub config: EngineConfig,
    pub split: usize,
    pub prefetch: bool,
}

pub async fn run_downloads(items: Vec<DownloadItem>, options: RunOptions) -> Result<()> {
    if items.is_empty() {
        bail!("Nothing to download");
    }
    fs::create_dir_all(&options.cache_dir)
        .await
        .context("Failed to create cache directory")?;

    let cache = Arc::new(DirCacheStore::new(options.cache_dir.clone()));
    let registry = DownloadRegistry::new(options.config, cache.clone(), Arc::new(LocalFileStore));

    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let header_pb = multi_progress.add(ProgressBar::new(0));
    header_pb.set_style(ProgressStyle::default_bar().template("{msg}")?);

    let total_files = items.len();
    let finished_files = Arc::new(AtomicUsize::new(0));
    let failed_files = Arc::new(AtomicUsize::new(0));
    let total_downloaded_bytes = Arc::new(AtomicU64::new(0));

    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")?
        .progress_chars("=>-");

    let mut handles = vec![];
    for item in items {
        let enqueue = if options.prefetch {
            EnqueueOptions::prefetch()
        } else {
            EnqueueOptions::chunked(options.split)
        }
        .with_extra_info(ExtraInfo {
            expected_size: None,
            expected_sha256: item.hash.clone(),
        });

        let enqueued = match registry.enqueue(&item.url, enqueue, None) {
            Ok(enqueued) => enqueued,
            Err(e) => {
                error!(url = %item.url, error = %e, "rejected");
                failed_files.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        if enqueued.already_active {
            // Listed twice; the first entry's bar already tracks it.
            finished_files.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let pb = multi_progress.add(ProgressBar::new(0));
        pb.set_style(bar_style.clone());
        pb.set_message(format!("Downloading {}", item.url));

        let finished_files = finished_files.clone();
        let failed_files = failed_files.clone();
        let total_downloaded_bytes = total_downloaded_bytes.clone();
        handles.push(tokio::spawn(async move {
            let event = track(&enqueued.handle, &pb).await;
            match &event {
                DownloadEvent::Success { file, elapsed_ms } => {
                    let size = fs::metadata(file).await.map(|m| m.len()).unwrap_or(0);
                    total_downloaded_bytes.fetch_add(size, Ordering::Relaxed);
                    pb.finish_with_message(format!("Completed   {} ({} ms)", item.url, elapsed_ms));
                }
                DownloadEvent::Stopped { file } => {
                    pb.finish_with_message(format!("Stopped     {} -> {:?}", item.url, file));
                }
                DownloadEvent::NotFound => {
                    failed_files.fetch_add(1, Ordering::Relaxed);
                    pb.abandon_with_message(format!("Not found   {}", item.url));
                }
                DownloadEvent::Cancelled => {
                    failed_files.fetch_add(1, Ordering::Relaxed);
                    pb.abandon_with_message(format!("Cancelled   {}", item.url));
                }
                DownloadEvent::Failure { message, .. } => {
                    failed_files.fetch_add(1, Ordering::Relaxed);
                    pb.abandon_with_message(format!("Failed      {}: {}", item.url, message));
                }
                DownloadEvent::Start { .. } | DownloadEvent::Progress { .. } => {}
            }
            finished_files.fetch_add(1, Ordering::Relaxed);
        }));
    }

    // Summary line, refreshed until every download ended.
    let summary = {
        let finished_files = finished_files.clone();
        let failed_files = failed_files.clone();
        let total_downloaded_bytes = total_downloaded_bytes.clone();
        let header_pb = header_pb.clone();
        tokio::spawn(async move {
            loop {
                let finished = finished_files.load(Ordering::Relaxed);
                header_pb.set_message(format!(
                    "Summary: Files: {}/{} | Failed: {} | Downloaded: {}",
                    finished,
                    total_files,
                    failed_files.load(Ordering::Relaxed),
                    HumanBytes(total_downloaded_bytes.load(Ordering::Relaxed)),
                ));
                header_pb.tick();
                if finished >= total_files {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let mut all_done = Box::pin(futures::future::join_all(handles));
    tokio::select! {
        _ = &mut all_done => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, cancelling downloads");
            if !cancel_and_wait(&registry, all_done, SHUTDOWN_GRACE).await {
                warn!("downloads still winding down after {:?}, exiting anyway", SHUTDOWN_GRACE);
            }
        }
    }
    summary.abort();
    header_pb.finish();

    info!(accounted = cache.accounted_bytes(), "cache updated");
    let failed = failed_files.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{} of {} downloads did not complete", failed, total_files);
    }
    Ok(())
}

/// Cancels everything and waits up to `grace` for `trackers`, which finish once their
/// downloads removed their chunk slots. Returns whether they all finished in time.
async fn cancel_and_wait<F: Future>(registry: &DownloadRegistry, trackers: F, grace: Duration) -> bool {
    registry.clear();
    tokio::time::timeout(grace, trackers).await.is_ok()
}

/// Mirrors a download's progress into `pb` until it ends, then returns the terminal event.
async fn track(handle: &DownloadHandle, pb: &ProgressBar) -> DownloadEvent {
    loop {
        pb.set_length(handle.total_bytes());
        pb.set_position(handle.downloaded_bytes());
        if let Some(event) = handle.outcome() {
            return event;
        }
        tokio::select! {
            event = handle.wait() => {
                pb.set_position(handle.downloaded_bytes());
                return event;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

pub async fn list_cache(cache_dir: PathBuf) -> Result<()> {
    if !cache_dir.exists() {
        println!("Cache directory {:?} does not exist.", cache_dir);
        return Ok(());
    }

    let store = DirCacheStore::new(cache_dir.clone());
    let entries = store.entries().context("Failed to read cache directory")?;
    if entries.is_empty() {
        println!("No completed downloads in {:?}.", cache_dir);
        return Ok(());
    }

    println!("{:<72} {:>12} {:>17}", "File", "Size", "Modified");
    println!("{:-<72} {:->12} {:->17}", "", "", "");
    let mut total: u64 = 0;
    for (path, size) in entries {
        total += size;
        let modified = fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        println!("{:<72} {:>12} {:>17}", name, HumanBytes(size).to_string(), modified);
    }
    println!("Total: {}", HumanBytes(total));
    Ok(())
}
