// Runtime locator - finds yt-dlp, ffmpeg and a JS runtime
//
// Search order per tool:
// 1. Bundled bin/ directory next to the application
// 2. Directories on the executable search path
//
// A located path is verified with a bounded version probe. A failed or
// timed-out probe is logged and the path is still used.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::config::LocatorConfig;
use super::errors::{DownloadError, Result};
use super::utils::{executable_name, find_in_dirs, first_line, run_output_with_timeout};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ToolId {
    YtDlp,
    Ffmpeg,
    Ffprobe,
    Deno,
    Node,
    Bun,
}

impl ToolId {
    /// Script runtimes in preference order
    pub const SCRIPT_RUNTIMES: [ToolId; 3] = [ToolId::Deno, ToolId::Node, ToolId::Bun];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolId::YtDlp => "yt-dlp",
            ToolId::Ffmpeg => "ffmpeg",
            ToolId::Ffprobe => "ffprobe",
            ToolId::Deno => "deno",
            ToolId::Node => "node",
            ToolId::Bun => "bun",
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            ToolId::Ffmpeg | ToolId::Ffprobe => "-version",
            _ => "--version",
        }
    }

    pub fn is_script_runtime(&self) -> bool {
        Self::SCRIPT_RUNTIMES.contains(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    Bundled,
    SystemPath,
}

/// Resolved tool path. Read-only after discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeLocation {
    pub tool: ToolId,
    pub path: PathBuf,
    pub source: ToolSource,
    /// Version probe succeeded
    pub verified: bool,
    pub version: Option<String>,
}

pub struct RuntimeLocator {
    bundled_dir: Option<PathBuf>,
    search_path: Vec<PathBuf>,
    probe_timeout_secs: u64,
}

impl RuntimeLocator {
    pub fn new(config: &LocatorConfig) -> Self {
        Self {
            bundled_dir: config.resolved_bundled_dir(),
            search_path: config.resolved_search_path(),
            probe_timeout_secs: config.probe_timeout_secs,
        }
    }

    /// Existence-only lookup, bundled first
    pub fn find(&self, tool: ToolId) -> Option<(PathBuf, ToolSource)> {
        let file_name = executable_name(tool.as_str());

        if let Some(dir) = &self.bundled_dir {
            if let Some(path) = find_in_dirs(&file_name, std::slice::from_ref(dir)) {
                return Some((path, ToolSource::Bundled));
            }
        }

        find_in_dirs(&file_name, &self.search_path).map(|p| (p, ToolSource::SystemPath))
    }

    /// Locate and soft-verify a tool
    pub async fn locate(&self, tool: ToolId) -> Result<RuntimeLocation> {
        let (path, source) = self.find(tool).ok_or_else(|| {
            DownloadError::tool_not_found(
                tool.as_str(),
                format!(
                    "Place {} in the bundled bin directory or install it on PATH",
                    executable_name(tool.as_str())
                ),
            )
        })?;

        debug!("[Locator] {} found at {} ({:?})", tool.as_str(), path.display(), source);

        let (verified, version) = self.probe(tool, &path).await;
        Ok(RuntimeLocation {
            tool,
            path,
            source,
            verified,
            version,
        })
    }

    async fn probe(&self, tool: ToolId, path: &Path) -> (bool, Option<String>) {
        let args = vec![tool.version_arg().to_string()];
        match run_output_with_timeout(path, &args, self.probe_timeout_secs).await {
            Ok(output) if output.status.success() => {
                let version = first_line(&output.stdout);
                let looks_right = match tool {
                    ToolId::Ffmpeg => version
                        .as_deref()
                        .map(|v| v.to_lowercase().contains("ffmpeg version"))
                        .unwrap_or(false),
                    _ => version.is_some(),
                };
                if !looks_right {
                    warn!(
                        "[Locator] {} found but version check returned unexpected output",
                        tool.as_str()
                    );
                }
                (looks_right, version)
            }
            Ok(output) => {
                warn!(
                    "[Locator] {} version check exited with {} - proceeding anyway",
                    tool.as_str(),
                    output.status
                );
                (false, None)
            }
            Err(e) => {
                warn!("[Locator] {} version check failed: {} - proceeding anyway", tool.as_str(), e);
                (false, None)
            }
        }
    }
}

/// Script runtime handed to the engine as `name:path`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsRuntime {
    pub name: String,
    pub path: PathBuf,
}

/// Tool paths the extraction engine needs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Directory containing ffmpeg (and ffprobe)
    pub ffmpeg_dir: Option<PathBuf>,
    pub js_runtime: Option<JsRuntime>,
}

/// Tool status for diagnostics display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: String,
    pub tool: ToolId,
    pub version: Option<String>,
    pub path: Option<String>,
    pub source: Option<ToolSource>,
    pub is_available: bool,
    pub required: bool,
}

/// Everything discovered at startup
#[derive(Debug, Clone)]
pub struct RuntimeInventory {
    pub ffmpeg: RuntimeLocation,
    pub ffprobe: Option<RuntimeLocation>,
    pub js_runtime: Option<RuntimeLocation>,
    pub engine: Option<RuntimeLocation>,
}

impl RuntimeInventory {
    /// Locate every tool. Only a missing ffmpeg is fatal.
    pub async fn discover(locator: &RuntimeLocator) -> Result<Self> {
        let ffmpeg = locator.locate(ToolId::Ffmpeg).await.map_err(|e| {
            warn!("[Locator] FFmpeg not found - required for merging and audio extraction");
            e
        })?;
        info!("[Locator] FFmpeg: {} ({:?})", ffmpeg.path.display(), ffmpeg.source);

        let ffprobe = locator.locate(ToolId::Ffprobe).await.ok();
        if ffprobe.is_none() {
            debug!("[Locator] ffprobe not found (optional)");
        }

        let mut js_runtime = None;
        for tool in ToolId::SCRIPT_RUNTIMES {
            if let Ok(loc) = locator.locate(tool).await {
                info!("[Locator] JS runtime: {} at {}", tool.as_str(), loc.path.display());
                js_runtime = Some(loc);
                break;
            }
        }
        if js_runtime.is_none() {
            warn!(
                "[Locator] No JavaScript runtime found (deno, node, bun). \
                 Some sites may fail to extract."
            );
        }

        let engine = match locator.locate(ToolId::YtDlp).await {
            Ok(loc) => Some(loc),
            Err(e) => {
                warn!("[Locator] {}", e);
                None
            }
        };

        Ok(Self {
            ffmpeg,
            ffprobe,
            js_runtime,
            engine,
        })
    }

    pub fn runtime_paths(&self) -> RuntimePaths {
        RuntimePaths {
            ffmpeg_dir: self.ffmpeg.path.parent().map(Path::to_path_buf),
            js_runtime: self.js_runtime.as_ref().map(|loc| JsRuntime {
                name: loc.tool.as_str().to_string(),
                path: loc.path.clone(),
            }),
        }
    }

    /// Path of the extraction engine executable
    pub fn engine_path(&self) -> Result<&Path> {
        self.engine.as_ref().map(|l| l.path.as_path()).ok_or_else(|| {
            DownloadError::tool_not_found("yt-dlp", "Install yt-dlp or place it in the bundled bin directory")
        })
    }

    pub fn tool_statuses(&self) -> Vec<ToolStatus> {
        let status = |tool: ToolId, loc: Option<&RuntimeLocation>, required: bool| ToolStatus {
            name: tool.as_str().to_string(),
            tool,
            version: loc.and_then(|l| l.version.clone()),
            path: loc.map(|l| l.path.display().to_string()),
            source: loc.map(|l| l.source),
            is_available: loc.is_some(),
            required,
        };

        let js_tool = self.js_runtime.as_ref().map(|l| l.tool).unwrap_or(ToolId::Deno);
        vec![
            status(ToolId::YtDlp, self.engine.as_ref(), true),
            status(ToolId::Ffmpeg, Some(&self.ffmpeg), true),
            status(ToolId::Ffprobe, self.ffprobe.as_ref(), false),
            status(js_tool, self.js_runtime.as_ref(), false),
        ]
    }
}
