use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{glog_debug, Error, Result};

const DEFAULT_MAX_CONCURRENCY: usize = 8;
const DEFAULT_GIT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PLATFORM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STATUS_CACHE_TTL_MS: u64 = 2000;

/// User-level settings read from `~/.grip/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrency: usize,
    pub git_timeout_secs: u64,
    pub platform_timeout_secs: u64,
    pub status_cache_ttl_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            git_timeout_secs: DEFAULT_GIT_TIMEOUT_SECS,
            platform_timeout_secs: DEFAULT_PLATFORM_TIMEOUT_SECS,
            status_cache_ttl_ms: DEFAULT_STATUS_CACHE_TTL_MS,
        }
    }
}

impl Config {
    pub fn grip_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".grip"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::grip_dir()?.join("config.toml"))
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn platform_timeout(&self) -> Duration {
        Duration::from_secs(self.platform_timeout_secs)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.status_cache_ttl_ms)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        glog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            glog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::parse(&fs::read_to_string(&path)?)?;
        glog_debug!(
            "Config loaded: max_concurrency={} git_timeout={}s platform_timeout={}s",
            config.max_concurrency,
            config.git_timeout_secs,
            config.platform_timeout_secs
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.max_concurrency == 0 {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}
