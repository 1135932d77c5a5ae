// Pre-download checks: connectivity, site reachability, free disk space
//
// Advisory only. Nothing here aborts a download by itself.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::Disks;
use tracing::{debug, info, warn};

use super::config::NetworkConfig;
use super::credentials::UserAgentPool;

pub const DEFAULT_MIN_DISK_GB: f64 = 2.0;

const CONNECTIVITY_ENDPOINTS: &[&str] = &[
    "https://www.google.com",
    "https://1.1.1.1",
    "https://www.cloudflare.com",
];

const SITE_PROBE_URL: &str = "https://www.youtube.com/robots.txt";
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
const SITE_TIMEOUT: Duration = Duration::from_secs(10);
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub passed: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl PreflightResult {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Outcome of the site reachability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteCheck {
    Accessible,
    /// Reachable but throttled
    Warning(String),
    Issue(String),
}

/// Map the robots.txt status code to a verdict
pub fn classify_site_status(status: u16) -> SiteCheck {
    match status {
        200..=299 => SiteCheck::Accessible,
        429 => SiteCheck::Warning("Site is rate limiting this IP - wait before retrying".to_string()),
        403 => SiteCheck::Issue("Site is blocking this IP - try using a VPN".to_string()),
        code => SiteCheck::Issue(format!("Site returned HTTP {}", code)),
    }
}

/// Nearest existing ancestor, so a not-yet-created output dir can be checked
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current.canonicalize().unwrap_or_else(|_| current.to_path_buf())
}

/// Free bytes on the disk holding `path` (longest mount-point match)
pub fn available_space(path: &Path) -> Option<u64> {
    let target = existing_ancestor(path);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(u64, usize)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if !target.starts_with(mount) {
            continue;
        }
        let depth = mount.components().count();
        if best.is_none_or(|(_, d)| depth > d) {
            best = Some((disk.available_space(), depth));
        }
    }
    best.map(|(bytes, _)| bytes)
}

/// Issue below `min_gb`, warning below twice that
fn evaluate_disk(available_gb: f64, min_gb: f64, result: &mut PreflightResult) {
    if available_gb < min_gb {
        result.issues.push(format!(
            "Low disk space: {:.1} GB available (need {} GB)",
            available_gb, min_gb
        ));
    } else if available_gb < min_gb * 2.0 {
        result.warnings.push(format!("Disk space is limited: {:.1} GB remaining", available_gb));
    }
}

pub struct PreflightChecker {
    network: NetworkConfig,
    user_agents: UserAgentPool,
}

impl PreflightChecker {
    pub fn new(network: NetworkConfig, user_agents: UserAgentPool) -> Self {
        Self { network, user_agents }
    }

    fn client(&self, timeout: Duration) -> Option<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy_url) = self.network.proxy.as_deref() {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => warn!("[Preflight] Invalid proxy URL {}: {}", proxy_url, e),
            }
        }
        match builder.build() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("[Preflight] Failed to build HTTP client: {}", e);
                None
            }
        }
    }

    pub async fn check_internet(&self) -> bool {
        let Some(client) = self.client(CONNECTIVITY_TIMEOUT) else {
            return false;
        };
        for endpoint in CONNECTIVITY_ENDPOINTS {
            match client.get(*endpoint).send().await {
                Ok(_) => return true,
                Err(e) => debug!("[Preflight] {} unreachable: {}", endpoint, e),
            }
        }
        false
    }

    pub async fn check_site(&self) -> SiteCheck {
        let Some(client) = self.client(SITE_TIMEOUT) else {
            return SiteCheck::Issue("Could not create HTTP client".to_string());
        };
        match client
            .get(SITE_PROBE_URL)
            .header(reqwest::header::USER_AGENT, self.user_agents.random())
            .send()
            .await
        {
            Ok(response) => classify_site_status(response.status().as_u16()),
            Err(e) => SiteCheck::Issue(format!("Cannot reach site: {}", e)),
        }
    }

    pub async fn run(&self, output_dir: &Path, min_disk_gb: f64, check_site: bool) -> PreflightResult {
        let mut result = PreflightResult::default();

        if !self.check_internet().await {
            result.issues.push("No internet connection detected".to_string());
        } else if check_site {
            match self.check_site().await {
                SiteCheck::Accessible => {}
                SiteCheck::Warning(msg) => result.warnings.push(msg),
                SiteCheck::Issue(msg) => result.issues.push(msg),
            }
        }

        let dir = output_dir.to_path_buf();
        let space = tokio::task::spawn_blocking(move || available_space(&dir)).await.ok().flatten();
        match space {
            Some(bytes) => evaluate_disk(bytes as f64 / BYTES_PER_GB, min_disk_gb, &mut result),
            None => result
                .warnings
                .push(format!("Could not check disk space for {}", output_dir.display())),
        }

        result.passed = result.issues.is_empty();
        if result.passed {
            info!("[Preflight] OK ({} warning(s))", result.warnings.len());
        } else {
            warn!("[Preflight] {} issue(s): {}", result.issues.len(), result.issues.join("; "));
        }
        result
    }
}

impl Default for PreflightChecker {
    fn default() -> Self {
        Self::new(NetworkConfig::default(), UserAgentPool::default())
    }
}

/// Run every check with default network settings
pub async fn run_preflight_checks(output_dir: &Path, min_disk_gb: f64, check_site: bool) -> PreflightResult {
    PreflightChecker::default().run(output_dir, min_disk_gb, check_site).await
}
