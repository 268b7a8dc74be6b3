use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify only items that carry a hash.
    Auto,
    /// Every item must carry a hash.
    On,
    Off,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub hash: Option<String>,
}

impl DownloadItem {
    /// Parses a `url` or `url|sha256` line.
    pub fn parse(line: &str) -> Option<Self> {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            return None;
        }
        let mut parts = raw.splitn(2, '|');
        let url = parts.next().unwrap_or_default().trim().to_string();
        let hash = parts.next().map(|h| h.trim().to_string()).filter(|s| !s.is_empty());
        if url.is_empty() {
            return None;
        }
        Some(Self { url, hash })
    }
}

pub async fn read_task_file(path: &Path) -> Result<Vec<DownloadItem>> {
    let file = fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open tasks file: {:?}", path))?;
    let mut lines = BufReader::new(file).lines();
    let mut items = vec![];
    while let Some(line) = lines.next_line().await? {
        if let Some(item) = DownloadItem::parse(&line) {
            items.push(item);
        }
    }
    Ok(items)
}

/// Applies the verification policy to the item list.
pub fn apply_verify_mode(items: Vec<DownloadItem>, mode: VerifyMode) -> Result<Vec<DownloadItem>> {
    match mode {
        VerifyMode::Auto => Ok(items),
        VerifyMode::Off => Ok(items
            .into_iter()
            .map(|item| DownloadItem { hash: None, ..item })
            .collect()),
        VerifyMode::On => {
            let missing: Vec<&str> = items
                .iter()
                .filter(|i| i.hash.is_none())
                .map(|i| i.url.as_str())
                .collect();
            if !missing.is_empty() {
                bail!("--verify-hash on, but these items carry no hash: {:?}", missing);
            }
            Ok(items)
        }
    }
}
