use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine tuning knobs, handed to the coordinator at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrent fetch/write pairs across all downloads.
    pub worker_threads: usize,
    /// Upper bound on chunks per download, whatever the caller asks for.
    pub max_chunk_count: usize,
    pub probe_timeout_ms: u64,
    /// Bytes between two progress reports / cancellation checks.
    pub buffer_size: usize,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
    pub rate_limit_bytes_per_sec: Option<u32>,
}

pub fn default_worker_threads() -> usize {
    (num_cpus::get() / 2).max(4)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_chunk_count: 8,
            probe_timeout_ms: 1000,
            buffer_size: 64 * 1024,
            read_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            user_agent: format!("mediafetch/{}", env!("CARGO_PKG_VERSION")),
            rate_limit_bytes_per_sec: None,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if self.max_chunk_count == 0 {
            bail!("max_chunk_count must be at least 1");
        }
        if self.buffer_size == 0 {
            bail!("buffer_size must be at least 1");
        }
        if self.rate_limit_bytes_per_sec == Some(0) {
            bail!("rate_limit_bytes_per_sec must be positive when set");
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn build_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.connect_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_cpu_count() {
        let config = EngineConfig::default();
        assert!(config.worker_threads >= 4);
        assert_eq!(config.probe_timeout(), Duration::from_millis(1000));
        assert_eq!(config.buffer_size, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_chunk_count": 3, "rate_limit_bytes_per_sec": 1024}"#).unwrap();
        assert_eq!(config.max_chunk_count, 3);
        assert_eq!(config.rate_limit_bytes_per_sec, Some(1024));
        assert_eq!(config.read_timeout_ms, 30_000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed = serde_json::from_str::<EngineConfig>(r#"{"split": 4}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn zero_values_fail_validation() {
        let config = EngineConfig {
            buffer_size: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            worker_threads: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"worker_threads": 2, "probe_timeout_ms": 250}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.probe_timeout(), Duration::from_millis(250));
    }
}
