use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout
const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;

/// Settings shared by the update engine, the reconciler and the repairer.
///
/// Built once per installation manager and passed in explicitly, so two
/// installations can be processed side by side with different settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads for per-file fan-out. 0 means available parallelism.
    pub workers: usize,
    /// Path or name of the `hpatchz` executable.
    pub hpatchz: PathBuf,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Extra attempts after a failed download.
    pub max_retries: u32,
    /// Base delay between download attempts, doubled after every retry.
    pub retry_backoff_ms: u64,
    /// Directory names that are never part of the distributed manifest
    /// (user caches). Matched against every path component.
    pub excluded_dirs: Vec<String>,
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            hpatchz: PathBuf::from(if cfg!(windows) { "hpatchz.exe" } else { "hpatchz" }),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            excluded_dirs: vec!["webCaches".to_string(), "SDKCaches".to_string()],
            user_agent: None,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing keys fall back to the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if self.hpatchz.as_os_str().is_empty() {
            return Err(Error::Config("hpatchz path is empty".into()));
        }
        Ok(())
    }

    /// Number of worker threads the pool should be built with
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    /// True if `relative` (forward-slash separated) lies in an excluded subtree
    pub fn is_excluded(&self, relative: &str) -> bool {
        relative
            .split('/')
            .any(|component| self.excluded_dirs.iter().any(|d| d == component))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, br#"{"workers": 3, "hpatchz": "/opt/hpatchz"}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.hpatchz, PathBuf::from("/opt/hpatchz"));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.read_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, br#"{"connect_timeout_secs": 0}"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn excluded_dirs_match_any_component() {
        let config = EngineConfig::default();
        assert!(config.is_excluded("Game_Data/webCaches/Cache/data_0"));
        assert!(config.is_excluded("webCaches/index"));
        assert!(!config.is_excluded("Game_Data/webCachesX/file"));
    }

    #[test]
    fn backoff_doubles() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_backoff(0), Duration::from_millis(250));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(1000));
    }
}
