// yt-dlp extraction engine
//
// Drives the yt-dlp executable as a subprocess:
// - EngineInvocation -> command-line flags
// - stdout progress/destination lines -> ProgressEvent
// - non-zero exit -> DownloadError::Engine(stderr) for classification
// - sink Cancel -> kill the child, EngineOutcome::Cancelled

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::downloader::credentials::CredentialSource;
use crate::downloader::diagnostics::summarize_error;
use crate::downloader::errors::{DownloadError, Result};
use crate::downloader::format_selector::{ContainerPolicy, PostProcessor};
use crate::downloader::mix_guard::PlaylistPolicy;
use crate::downloader::models::{PlaylistInfo, PlaylistItem, ProgressEvent};
use crate::downloader::tools::{RuntimeInventory, RuntimePaths};
use crate::downloader::traits::{
    EngineInvocation, EngineOutcome, ExtractionEngine, ProgressSink, SinkControl,
};
use crate::downloader::utils::{get_proxy_args, get_timeout_args, run_output_with_timeout};

/// Structured progress line, one per update thanks to --newline
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s|%(progress.downloaded_bytes)s|%(progress.total_bytes,progress.total_bytes_estimate)s";

lazy_static! {
    // [download]  12.5% of ~ 310.04MiB at  374.36KiB/s ETA 11:59 (frag 56/454)
    static ref CLASSIC_PROGRESS_RE: Regex = Regex::new(
        r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*\s*\w+)\s+at\s+(\d+\.?\d*\s*\w+/s)(?:\s+ETA\s+(\S+))?"
    )
    .expect("static regex");
    static ref ALREADY_RE: Regex =
        Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").expect("static regex");
}

/// Tracks the final output filename across destination/merge lines
#[derive(Debug, Default)]
struct OutputTracker {
    filename: Option<String>,
}

impl OutputTracker {
    /// Inspect one stdout line, returning a progress event if it carries one
    fn observe(&mut self, line: &str) -> Option<ProgressEvent> {
        if let Some(dest) = parse_destination_line(line) {
            debug!("[yt-dlp] destination: {}", dest);
            self.filename = Some(dest);
            return None;
        }
        parse_progress_line(line)
    }
}

/// Parse a structured or classic progress line
fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("[progress]") {
        let fields: Vec<&str> = rest.split('|').map(str::trim).collect();
        if fields.len() < 5 {
            return None;
        }
        let downloaded_bytes = parse_bytes(fields[3]);
        let total_bytes = parse_bytes(fields[4]);
        let percentage = parse_percent(fields[0]).or_else(|| match (downloaded_bytes, total_bytes) {
            (Some(d), Some(t)) if t > 0 => Some(d as f64 * 100.0 / t as f64),
            _ => None,
        })?;

        return Some(ProgressEvent::Downloading {
            percentage,
            speed: known(fields[1]),
            eta: known(fields[2]),
            downloaded_bytes,
            total_bytes,
        });
    }

    let caps = CLASSIC_PROGRESS_RE.captures(line)?;
    let percentage: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(ProgressEvent::Downloading {
        percentage,
        speed: caps.get(3).map(|m| m.as_str().to_string()),
        eta: caps.get(4).map(|m| m.as_str().to_string()),
        downloaded_bytes: None,
        total_bytes: None,
    })
}

/// Output path from destination, merger, audio-extract or already-downloaded lines
fn parse_destination_line(line: &str) -> Option<String> {
    let line = line.trim();

    for prefix in ["[download] Destination:", "[ExtractAudio] Destination:"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            let path = rest.trim();
            if !path.is_empty() {
                return Some(path.to_string());
            }
        }
    }

    if let Some(rest) = line.strip_prefix("[Merger] Merging formats into \"") {
        let path = rest.trim_end_matches('"');
        if !path.is_empty() {
            return Some(path.to_string());
        }
    }

    ALREADY_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn parse_percent(s: &str) -> Option<f64> {
    s.trim().trim_end_matches('%').trim().parse::<f64>().ok()
}

fn parse_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    s.parse::<u64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64))
}

/// yt-dlp prints "NA", "N/A" or "Unknown" for missing fields
fn known(s: &str) -> Option<String> {
    match s.trim() {
        "" | "NA" | "N/A" | "Unknown" | "None" => None,
        other => Some(other.to_string()),
    }
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

fn credential_args(args: &mut Vec<String>, credentials: &CredentialSource, user_agent: &str) {
    match credentials {
        CredentialSource::Browser { choice, .. } => {
            push_pair(args, "--cookies-from-browser", choice.name.clone())
        }
        CredentialSource::CookieFile(path) => push_pair(args, "--cookies", path.display().to_string()),
        CredentialSource::None => {}
    }
    if !user_agent.is_empty() {
        push_pair(args, "--user-agent", user_agent);
    }
}

fn runtime_args(args: &mut Vec<String>, runtimes: &RuntimePaths) {
    if let Some(dir) = &runtimes.ffmpeg_dir {
        push_pair(args, "--ffmpeg-location", dir.display().to_string());
    }
    if let Some(js) = &runtimes.js_runtime {
        push_pair(args, "--js-runtimes", format!("{}:{}", js.name, js.path.display()));
    }
}

fn playlist_args(args: &mut Vec<String>, policy: PlaylistPolicy) {
    match policy {
        PlaylistPolicy::SingleItem => args.push("--no-playlist".to_string()),
        PlaylistPolicy::Capped { max_items, ignore_errors } => {
            args.push("--yes-playlist".to_string());
            push_pair(args, "--playlist-end", max_items.to_string());
            if ignore_errors {
                args.push("--ignore-errors".to_string());
            }
        }
        PlaylistPolicy::Full => args.push("--yes-playlist".to_string()),
    }
}

/// Map a typed invocation to yt-dlp download flags
pub fn build_download_args(inv: &EngineInvocation) -> Vec<String> {
    let mut args = vec!["--newline".to_string()];
    push_pair(&mut args, "--progress-template", PROGRESS_TEMPLATE);

    push_pair(&mut args, "-f", inv.format.format.clone());
    push_pair(&mut args, "-P", inv.output_dir.display().to_string());
    push_pair(&mut args, "-o", inv.engine.output_template.clone());
    if inv.engine.restrict_filenames {
        args.push("--restrict-filenames".to_string());
    }
    if inv.engine.windows_filenames {
        args.push("--windows-filenames".to_string());
    }

    push_pair(&mut args, "--retries", inv.engine.retries.to_string());
    push_pair(
        &mut args,
        "--fragment-retries",
        inv.engine
            .fragment_retries
            .map(|n| n.to_string())
            .unwrap_or_else(|| "infinite".to_string()),
    );
    push_pair(&mut args, "--file-access-retries", inv.engine.file_access_retries.to_string());

    for pp in &inv.format.postprocessors {
        match pp {
            PostProcessor::ExtractAudio { codec, quality } => {
                args.push("-x".to_string());
                push_pair(&mut args, "--audio-format", codec.clone());
                push_pair(&mut args, "--audio-quality", quality.engine_value());
            }
            PostProcessor::EmbedMetadata => args.push("--embed-metadata".to_string()),
            PostProcessor::EmbedThumbnail => args.push("--embed-thumbnail".to_string()),
        }
    }
    if inv.format.write_thumbnail && !inv.format.embeds_thumbnail() {
        args.push("--write-thumbnail".to_string());
    }

    if let ContainerPolicy::Merge(container) = &inv.format.container {
        push_pair(&mut args, "--merge-output-format", container.clone());
    }

    credential_args(&mut args, &inv.credentials, &inv.user_agent);
    playlist_args(&mut args, inv.playlist);
    runtime_args(&mut args, &inv.runtimes);
    args.extend(get_proxy_args(&inv.network));
    args.extend(get_timeout_args(&inv.network));

    // Nothing after this can be read as an option
    args.push("--".to_string());
    args.push(inv.url.clone());
    args
}

/// Map a typed invocation to yt-dlp flat playlist extraction flags
pub fn build_playlist_args(inv: &EngineInvocation) -> Vec<String> {
    let mut args = vec![
        "--flat-playlist".to_string(),
        "--dump-single-json".to_string(),
        "--no-warnings".to_string(),
    ];
    match inv.playlist {
        PlaylistPolicy::SingleItem => args.push("--no-playlist".to_string()),
        PlaylistPolicy::Capped { max_items, .. } => {
            args.push("--yes-playlist".to_string());
            push_pair(&mut args, "--playlist-end", max_items.to_string());
        }
        PlaylistPolicy::Full => args.push("--yes-playlist".to_string()),
    }
    credential_args(&mut args, &inv.credentials, &inv.user_agent);
    runtime_args(&mut args, &inv.runtimes);
    args.extend(get_proxy_args(&inv.network));
    args.extend(get_timeout_args(&inv.network));
    args.push("--".to_string());
    args.push(inv.url.clone());
    args
}

/// Build PlaylistInfo from `--dump-single-json` output. `None` if not a playlist.
pub fn parse_playlist_json(
    json: &serde_json::Value,
    source_url: &str,
    max_items: Option<usize>,
) -> Option<PlaylistInfo> {
    if json.get("_type").and_then(|v| v.as_str()) != Some("playlist") {
        return None;
    }

    let text = |key: &str| json.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let entries = json.get("entries").and_then(|v| v.as_array())?;

    let mut items = Vec::new();
    // Null entries are unavailable videos
    for entry in entries.iter().filter(|e| !e.is_null()) {
        if max_items.is_some_and(|max| items.len() >= max) {
            break;
        }
        let id = entry.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        if id.is_empty() {
            continue;
        }
        let title = entry
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let url = entry
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));

        let mut item = PlaylistItem::new(items.len() + 1, id, title, url);
        item.duration = entry.get("duration").and_then(|v| v.as_f64());
        items.push(item);
    }

    Some(PlaylistInfo {
        playlist_id: text("id").unwrap_or_default(),
        title: text("title").unwrap_or_else(|| "Unknown Playlist".to_string()),
        uploader: text("uploader")
            .or_else(|| text("channel"))
            .unwrap_or_else(|| "Unknown".to_string()),
        url: text("webpage_url").unwrap_or_else(|| source_url.to_string()),
        items,
        current_index: 0,
    })
}

/// yt-dlp subprocess backend
pub struct YtDlpEngine {
    executable: PathBuf,
    poll_interval: Duration,
}

impl YtDlpEngine {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn from_inventory(inventory: &RuntimeInventory) -> Result<Self> {
        Ok(Self::new(inventory.engine_path()?))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn spawn(&self, args: &[String]) -> Result<Child> {
        Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DownloadError::ExecutionError(format!(
                    "Failed to start {}: {}",
                    self.executable.display(),
                    e
                ))
            })
    }
}

#[async_trait]
impl ExtractionEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn download(
        &self,
        invocation: &EngineInvocation,
        sink: &dyn ProgressSink,
    ) -> Result<EngineOutcome> {
        let args = build_download_args(invocation);
        debug!("[yt-dlp] args: {:?}", args);

        let mut child = self.spawn(&args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::ExecutionError("No stdout from yt-dlp".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::ExecutionError("No stderr from yt-dlp".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut tick = tokio::time::interval(self.poll_interval);
        let mut tracker = OutputTracker::default();
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(event) = tracker.observe(&line) {
                            if sink.emit(event) == SinkControl::Cancel {
                                cancelled = true;
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[yt-dlp] stdout read failed: {}", e);
                        break;
                    }
                },
                _ = tick.tick() => {
                    if sink.poll() == SinkControl::Cancel {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        let status = if cancelled {
            None
        } else {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        break Some(status.map_err(|e| {
                            DownloadError::ExecutionError(format!("yt-dlp process failed: {}", e))
                        })?);
                    }
                    _ = tick.tick() => {
                        if sink.poll() == SinkControl::Cancel {
                            break None;
                        }
                    }
                }
            }
        };

        let Some(status) = status else {
            info!("[yt-dlp] cancelled, killing process");
            let _ = child.kill().await;
            stderr_task.abort();
            return Ok(EngineOutcome::Cancelled);
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(EngineOutcome::Completed {
                filename: tracker.filename,
            });
        }

        let message = if stderr_text.trim().is_empty() {
            format!("yt-dlp exited with {}", status)
        } else {
            stderr_text.trim().to_string()
        };
        warn!("[yt-dlp] failed: {}", summarize_error(&message));
        Err(DownloadError::Engine(message))
    }

    async fn extract_playlist(&self, invocation: &EngineInvocation) -> Result<Option<PlaylistInfo>> {
        let args = build_playlist_args(invocation);
        debug!("[yt-dlp] playlist args: {:?}", args);

        let output =
            run_output_with_timeout(&self.executable, &args, invocation.engine.playlist_timeout_secs)
                .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DownloadError::Engine(if stderr.is_empty() {
                format!("yt-dlp playlist extraction exited with {}", output.status)
            } else {
                stderr
            }));
        }

        let json: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| DownloadError::ParseError(format!("yt-dlp returned invalid JSON: {}", e)))?;

        let max_items = match invocation.playlist {
            PlaylistPolicy::Capped { max_items, .. } => Some(max_items),
            _ => None,
        };
        let info = parse_playlist_json(&json, &invocation.url, max_items);
        if let Some(p) = &info {
            info!("[yt-dlp] playlist '{}': {} items", p.title, p.items.len());
        }
        Ok(info)
    }
}
