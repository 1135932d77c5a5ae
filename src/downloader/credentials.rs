// Credential negotiation - browser cookies, cookies.txt, User-Agent matching
//
// Priority:
// 1. First installed, unlocked browser from the priority table
//    (the rest become fallbacks for the retry loop)
// 2. Manually exported cookies.txt in a well-known location
// 3. Anonymous
//
// Chromium-family browsers hold an exclusive lock on their cookie database
// while running, so a running Chromium browser is skipped.

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Rendering engine lineage, used to match a User-Agent to a cookie source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserFamily {
    Gecko,
    Chromium,
    /// Chromium with an `Edg/` token
    Edge,
    WebKit,
}

/// Static description of one supported browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSpec {
    /// Name understood by the engine's cookies-from-browser option
    pub name: String,
    pub family: BrowserFamily,
    /// Any existing path means "installed"
    pub profile_paths: Vec<PathBuf>,
    /// Executable names used for the running check
    pub process_names: Vec<String>,
    /// Whether the cookie store is exclusively locked while running
    pub locks_cookie_store: bool,
}

/// Browsers in negotiation priority order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrowserTable {
    browsers: Vec<BrowserSpec>,
}

impl BrowserTable {
    pub fn new(browsers: Vec<BrowserSpec>) -> Self {
        Self { browsers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrowserSpec> {
        self.browsers.iter()
    }

    pub fn get(&self, name: &str) -> Option<&BrowserSpec> {
        self.browsers.iter().find(|b| b.name == name)
    }

    pub fn len(&self) -> usize {
        self.browsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.browsers.is_empty()
    }
}

impl Default for BrowserTable {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let under_home = |paths: &[&str]| -> Vec<PathBuf> { paths.iter().map(|p| home.join(p)).collect() };
        let procs = |names: &[&str]| -> Vec<String> { names.iter().map(|n| n.to_string()).collect() };

        let spec = |name: &str, family, profile_paths, process_names, locks| BrowserSpec {
            name: name.to_string(),
            family,
            profile_paths,
            process_names,
            locks_cookie_store: locks,
        };

        // Non-locking browsers first
        Self::new(vec![
            spec(
                "firefox",
                BrowserFamily::Gecko,
                under_home(&[
                    "AppData/Roaming/Mozilla/Firefox/Profiles",
                    ".mozilla/firefox",
                    "Library/Application Support/Firefox/Profiles",
                ]),
                procs(&["firefox.exe", "firefox"]),
                false,
            ),
            spec(
                "safari",
                BrowserFamily::WebKit,
                under_home(&["Library/Cookies", "Library/Containers/com.apple.Safari"]),
                procs(&["Safari"]),
                false,
            ),
            spec(
                "chrome",
                BrowserFamily::Chromium,
                under_home(&[
                    "AppData/Local/Google/Chrome/User Data",
                    ".config/google-chrome",
                    "Library/Application Support/Google/Chrome",
                ]),
                procs(&["chrome.exe", "chrome", "Google Chrome"]),
                true,
            ),
            spec(
                "edge",
                BrowserFamily::Edge,
                under_home(&[
                    "AppData/Local/Microsoft/Edge/User Data",
                    ".config/microsoft-edge",
                    "Library/Application Support/Microsoft Edge",
                ]),
                procs(&["msedge.exe", "msedge", "Microsoft Edge"]),
                true,
            ),
            spec(
                "brave",
                BrowserFamily::Chromium,
                under_home(&[
                    "AppData/Local/BraveSoftware/Brave-Browser/User Data",
                    ".config/BraveSoftware/Brave-Browser",
                    "Library/Application Support/BraveSoftware/Brave-Browser",
                ]),
                procs(&["brave.exe", "brave", "Brave Browser"]),
                true,
            ),
            spec(
                "opera",
                BrowserFamily::Chromium,
                under_home(&[
                    "AppData/Roaming/Opera Software/Opera Stable",
                    ".config/opera",
                    "Library/Application Support/com.operasoftware.Opera",
                ]),
                procs(&["opera.exe", "opera", "Opera"]),
                true,
            ),
            spec(
                "vivaldi",
                BrowserFamily::Chromium,
                under_home(&[
                    "AppData/Local/Vivaldi/User Data",
                    ".config/vivaldi",
                    "Library/Application Support/Vivaldi",
                ]),
                procs(&["vivaldi.exe", "vivaldi", "vivaldi-bin", "Vivaldi"]),
                true,
            ),
            spec(
                "chromium",
                BrowserFamily::Chromium,
                under_home(&[
                    "AppData/Local/Chromium/User Data",
                    ".config/chromium",
                    "Library/Application Support/Chromium",
                ]),
                procs(&["chromium.exe", "chromium", "chromium-browser", "Chromium"]),
                true,
            ),
            spec(
                "whale",
                BrowserFamily::Chromium,
                under_home(&["AppData/Local/Naver/Naver Whale/User Data", ".config/naver-whale"]),
                procs(&["whale.exe", "whale", "naver-whale"]),
                true,
            ),
        ])
    }
}

/// Platform capability the negotiator needs: installed and running checks
pub trait BrowserProbe: Send + Sync {
    fn is_installed(&self, browser: &BrowserSpec) -> bool;
    fn is_running(&self, browser: &BrowserSpec) -> bool;
}

/// Filesystem + process-table probe
pub struct SystemBrowserProbe {
    /// Lowercased process names with `.exe` stripped, refreshed lazily
    snapshot: Mutex<Option<(Instant, HashSet<String>)>>,
    max_age: Duration,
}

impl SystemBrowserProbe {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(None),
            max_age: Duration::from_secs(2),
        }
    }

    fn running_processes(&self) -> HashSet<String> {
        let mut guard = match self.snapshot.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some((taken, names)) = guard.as_ref() {
            if taken.elapsed() < self.max_age {
                return names.clone();
            }
        }

        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let names: HashSet<String> = sys
            .processes()
            .values()
            .map(|p| normalize_process_name(&p.name().to_string_lossy()))
            .collect();

        debug!("[Credentials] process snapshot: {} entries", names.len());
        *guard = Some((Instant::now(), names.clone()));
        names
    }
}

impl Default for SystemBrowserProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserProbe for SystemBrowserProbe {
    fn is_installed(&self, browser: &BrowserSpec) -> bool {
        browser.profile_paths.iter().any(|p| p.exists())
    }

    fn is_running(&self, browser: &BrowserSpec) -> bool {
        if !browser.locks_cookie_store || browser.process_names.is_empty() {
            return false;
        }
        let running = self.running_processes();
        browser
            .process_names
            .iter()
            .any(|n| running.contains(&normalize_process_name(n)))
    }
}

fn normalize_process_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Pool of realistic User-Agent strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self::new(
            [
                // Chrome on Windows
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
                // Firefox on Windows
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:134.0) Gecko/20100101 Firefox/134.0",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:132.0) Gecko/20100101 Firefox/132.0",
                // Edge on Windows
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 Edg/130.0.0.0",
                // Chrome on macOS
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
                // Safari on macOS
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.2 Safari/605.1.15",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Self {
        Self { agents }
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// First entry of the same engine lineage, else the first entry
    pub fn matching(&self, family: BrowserFamily) -> String {
        let hit = self.agents.iter().find(|ua| match family {
            BrowserFamily::Gecko => ua.contains("Firefox"),
            BrowserFamily::Chromium => ua.contains("Chrome") && !ua.contains("Edg"),
            BrowserFamily::Edge => ua.contains("Edg"),
            BrowserFamily::WebKit => ua.contains("Safari") && !ua.contains("Chrome"),
        });
        hit.or_else(|| self.agents.first())
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string())
    }

    /// Uniformly random entry
    pub fn random(&self) -> String {
        self.agents
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string())
    }
}

/// Well-known places a user might drop an exported cookies.txt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieFileLocations {
    paths: Vec<PathBuf>,
}

impl Default for CookieFileLocations {
    fn default() -> Self {
        let mut paths = Vec::new();
        if let Some(app_dir) = std::env::current_exe().ok().and_then(|e| e.parent().map(Path::to_path_buf)) {
            paths.push(app_dir.join("cookies.txt"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("cookies.txt"));
        }
        if let Some(downloads) = dirs::download_dir() {
            paths.push(downloads.join("cookies.txt"));
        }
        Self { paths }
    }
}

impl CookieFileLocations {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// First location holding something that looks like a cookie file
    pub fn find_valid(&self) -> Option<PathBuf> {
        self.paths.iter().find(|p| is_cookie_file(p)).cloned()
    }
}

/// Sniff the first line for a Netscape cookie-file signature
pub fn is_cookie_file(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut first_line = String::new();
    if BufReader::new(file).read_line(&mut first_line).is_err() {
        return false;
    }
    let line = first_line.trim().to_lowercase();
    line.contains("cookie") || line.starts_with('#')
}

/// A browser chosen as cookie source, with its 1-based priority rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserChoice {
    pub name: String,
    pub rank: usize,
    pub family: BrowserFamily,
}

/// Where authentication cookies come from. At most one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Browser {
        choice: BrowserChoice,
        /// Other usable browsers, in priority order
        fallbacks: Vec<BrowserChoice>,
    },
    CookieFile(PathBuf),
    None,
}

impl CredentialSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Browser { choice, .. } => format!("browser:{}", choice.name),
            Self::CookieFile(path) => format!("cookies.txt:{}", path.display()),
            Self::None => "anonymous".to_string(),
        }
    }
}

/// Credential source plus the User-Agent that goes with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedCredentials {
    pub source: CredentialSource,
    pub user_agent: String,
}

impl NegotiatedCredentials {
    pub fn anonymous(user_agents: &UserAgentPool) -> Self {
        Self {
            source: CredentialSource::None,
            user_agent: user_agents.random(),
        }
    }

    /// Switch to the next fallback browser, re-matching the User-Agent.
    ///
    /// Returns `None` when the source is not a browser or no fallback is left.
    pub fn next_fallback(&self, user_agents: &UserAgentPool) -> Option<Self> {
        let CredentialSource::Browser { fallbacks, .. } = &self.source else {
            return None;
        };
        let (next, rest) = fallbacks.split_first()?;

        Some(Self {
            user_agent: user_agents.matching(next.family),
            source: CredentialSource::Browser {
                choice: next.clone(),
                fallbacks: rest.to_vec(),
            },
        })
    }
}

/// Picks a cookie source and a matching User-Agent
pub struct CredentialNegotiator {
    browsers: BrowserTable,
    probe: Arc<dyn BrowserProbe>,
    user_agents: UserAgentPool,
    cookie_files: CookieFileLocations,
}

impl CredentialNegotiator {
    pub fn new(
        browsers: BrowserTable,
        probe: Arc<dyn BrowserProbe>,
        user_agents: UserAgentPool,
        cookie_files: CookieFileLocations,
    ) -> Self {
        Self {
            browsers,
            probe,
            user_agents,
            cookie_files,
        }
    }

    pub fn user_agents(&self) -> &UserAgentPool {
        &self.user_agents
    }

    /// Installed browsers whose cookie store can be read right now
    fn available_browsers(&self) -> Vec<BrowserChoice> {
        let mut available = Vec::new();
        let mut locked = Vec::new();

        for (i, spec) in self.browsers.iter().enumerate() {
            if !self.probe.is_installed(spec) {
                debug!("[Credentials] browser not installed: {}", spec.name);
                continue;
            }
            if spec.locks_cookie_store && self.probe.is_running(spec) {
                debug!("[Credentials] browser running (locked): {}", spec.name);
                locked.push(spec.name.as_str());
                continue;
            }
            available.push(BrowserChoice {
                name: spec.name.clone(),
                rank: i + 1,
                family: spec.family,
            });
        }

        if !locked.is_empty() {
            warn!(
                "[Credentials] Browsers with locked cookies (close for better auth): {}",
                locked.join(", ")
            );
        }

        available
    }

    /// Choose a credential source and matching User-Agent
    pub fn negotiate(&self) -> NegotiatedCredentials {
        let mut available = self.available_browsers().into_iter();

        if let Some(choice) = available.next() {
            let fallbacks: Vec<BrowserChoice> = available.collect();
            info!(
                "[Credentials] Using {} cookies (fallbacks: {})",
                choice.name,
                fallbacks.iter().map(|b| b.name.as_str()).collect::<Vec<_>>().join(", ")
            );
            return NegotiatedCredentials {
                user_agent: self.user_agents.matching(choice.family),
                source: CredentialSource::Browser { choice, fallbacks },
            };
        }

        if let Some(path) = self.cookie_files.find_valid() {
            info!("[Credentials] Using manual cookies file: {}", path.display());
            return NegotiatedCredentials {
                source: CredentialSource::CookieFile(path),
                user_agent: self.user_agents.random(),
            };
        }

        warn!(
            "[Credentials] No browser cookies available. Some videos may require authentication. \
             Close Chrome/Edge, install Firefox, or export cookies to cookies.txt"
        );
        NegotiatedCredentials::anonymous(&self.user_agents)
    }
}
