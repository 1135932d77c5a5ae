// Downloader configuration
//
// Every table the components consult (qualities, browsers, user agents,
// mix prefixes, retry timings) lives here as plain data injected at
// construction time. Nothing reads global state.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::{BrowserTable, CookieFileLocations, UserAgentPool};
use super::errors::{DownloadError, Result};
use super::format_selector::QualityTable;
use super::mix_guard::MixGuardConfig;

pub const ENV_MAX_RETRIES: &str = "VIDEO_DL_MAX_RETRIES";
pub const ENV_PROXY: &str = "VIDEO_DL_PROXY";
pub const ENV_BIN_DIR: &str = "VIDEO_DL_BIN_DIR";

/// Exponential backoff with additive jitter.
///
/// `delay(k) = min(base * 2^(k-1), max) + uniform(0, that * jitter_ratio)`
/// for the k-th retry (k >= 1). The first attempt never waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Default total attempts when a request does not say otherwise
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2.0,
            max_delay_secs: 30.0,
            jitter_ratio: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Capped exponential delay before retry `k`, without jitter
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        // Saturate the exponent so large retry counts can't overflow
        let multiplier = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX) as f64;
        let secs = (self.base_delay_secs * multiplier).min(self.max_delay_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay before retry `k` including jitter
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        let jitter_max = base.as_secs_f64() * self.jitter_ratio;
        if jitter_max <= 0.0 {
            return base;
        }
        let jitter = rand::rng().random_range(0.0..jitter_max);
        base + Duration::from_secs_f64(jitter)
    }

    fn validate(&self) -> Result<()> {
        if !(self.base_delay_secs > 0.0) {
            return Err(DownloadError::Config(format!(
                "retry base delay must be positive, got {}",
                self.base_delay_secs
            )));
        }
        if self.max_delay_secs < self.base_delay_secs {
            return Err(DownloadError::Config(format!(
                "retry max delay {} is below base delay {}",
                self.max_delay_secs, self.base_delay_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(DownloadError::Config(format!(
                "jitter ratio must be within [0, 1], got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }
}

/// Network configuration for backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Proxy URL (e.g., "socks5://127.0.0.1:1080")
    pub proxy: Option<String>,

    /// Socket timeout in seconds
    pub timeout: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout: Some(15),
        }
    }
}

/// Options passed straight through to the extraction engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Output filename template relative to the output directory
    pub output_template: String,
    pub restrict_filenames: bool,
    pub windows_filenames: bool,
    /// Engine-internal HTTP retries
    pub retries: u32,
    /// `None` means retry fragments forever
    pub fragment_retries: Option<u32>,
    pub file_access_retries: u32,
    /// Bound on flat playlist extraction
    pub playlist_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_template: "%(title).100s_%(id)s.%(ext)s".to_string(),
            restrict_filenames: true,
            windows_filenames: true,
            retries: 10,
            fragment_retries: None,
            file_access_retries: 3,
            playlist_timeout_secs: 120,
        }
    }
}

/// Where the Runtime Locator looks for external tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Bundled tool directory. `None` means `<exe dir>/bin`.
    pub bundled_dir: Option<PathBuf>,
    /// Explicit search path. `None` means the process `PATH`.
    pub search_path: Option<Vec<PathBuf>>,
    /// Bound on `-version` style probes
    pub probe_timeout_secs: u64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            bundled_dir: None,
            search_path: None,
            probe_timeout_secs: 10,
        }
    }
}

impl LocatorConfig {
    pub fn resolved_bundled_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.bundled_dir {
            return Some(dir.clone());
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.join("bin")))
    }

    pub fn resolved_search_path(&self) -> Vec<PathBuf> {
        match &self.search_path {
            Some(dirs) => dirs.clone(),
            None => std::env::var_os("PATH")
                .map(|p| std::env::split_paths(&p).collect())
                .unwrap_or_default(),
        }
    }
}

/// Aggregate configuration for one downloader instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub retry: RetryPolicy,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
    pub locator: LocatorConfig,
    pub qualities: QualityTable,
    pub browsers: BrowserTable,
    pub user_agents: UserAgentPool,
    pub cookie_files: CookieFileLocations,
    pub mix_guard: MixGuardConfig,
}

impl DownloaderConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;

        if self.network.timeout == Some(0) {
            return Err(DownloadError::Config("socket timeout must be positive".to_string()));
        }
        if self.locator.probe_timeout_secs == 0 {
            return Err(DownloadError::Config("probe timeout must be positive".to_string()));
        }
        if self.mix_guard.max_items == 0 {
            return Err(DownloadError::Config("mix playlist cap must be positive".to_string()));
        }
        if self.user_agents.is_empty() {
            return Err(DownloadError::Config("user agent pool is empty".to_string()));
        }
        if self.engine.output_template.trim().is_empty() {
            return Err(DownloadError::Config("output template is empty".to_string()));
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            let value = raw.trim().parse::<u32>().map_err(|e| {
                DownloadError::Config(format!("{}={:?} is not a number: {}", ENV_MAX_RETRIES, raw, e))
            })?;
            debug!("[Config] {} override: {}", ENV_MAX_RETRIES, value);
            self.retry.max_retries = value;
        }

        if let Some(raw) = lookup(ENV_PROXY) {
            let proxy = raw.trim();
            if proxy.is_empty() {
                self.network.proxy = None;
            } else {
                debug!("[Config] {} override: {}", ENV_PROXY, proxy);
                self.network.proxy = Some(proxy.to_string());
            }
        }

        if let Some(raw) = lookup(ENV_BIN_DIR) {
            let dir = PathBuf::from(raw.trim());
            if !dir.is_dir() {
                warn!("[Config] {} points to a missing directory: {}", ENV_BIN_DIR, dir.display());
            }
            self.locator.bundled_dir = Some(dir);
        }

        Ok(())
    }
}
