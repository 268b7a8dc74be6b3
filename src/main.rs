mod cli;
mod commands;

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::cli::{DownloadItem, VerifyMode};
use crate::commands::RunOptions;
use mediafetch::EngineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download (if given, --tasks-file is ignored)
    #[arg(index = 1)]
    urls: Vec<String>,

    /// Path to a file with one `url` or `url|sha256` per line
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    tasks_file: PathBuf,

    /// Cache directory that receives completed files
    #[arg(short = 'd', long = "cache-dir", default_value = "downloads")]
    cache_dir: PathBuf,

    /// Worker pool size (defaults to max(cpus / 2, 4))
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Number of byte ranges per file
    #[arg(short = 's', long, default_value_t = 4)]
    split: usize,

    /// Download as low-priority prefetch (always a single stream)
    #[arg(long)]
    prefetch: bool,

    /// Engine configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// List completed files in the cache directory
    #[arg(short = 'l', long)]
    list: bool,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    verify_hash: VerifyMode,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediafetch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config.worker_threads = concurrency;
    }
    if args.rate_limit.is_some() {
        config.rate_limit_bytes_per_sec = args.rate_limit;
    }
    config.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if args.list {
            return commands::list_cache(args.cache_dir).await;
        }

        let items = if args.urls.is_empty() {
            cli::read_task_file(&args.tasks_file).await?
        } else {
            args.urls.iter().map(String::as_str).filter_map(DownloadItem::parse).collect()
        };
        if items.is_empty() {
            bail!("No URLs given and {:?} lists none", args.tasks_file);
        }
        let items = cli::apply_verify_mode(items, args.verify_hash)?;

        commands::run_downloads(
            items,
            RunOptions {
                cache_dir: args.cache_dir,
                config,
                split: args.split,
                prefetch: args.prefetch,
            },
        )
        .await
    })
}
