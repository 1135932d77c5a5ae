// Test doubles for the orchestration layer

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::config::DownloaderConfig;
use super::credentials::{
    BrowserFamily, BrowserProbe, BrowserSpec, BrowserTable, CookieFileLocations, CredentialSource,
};
use super::errors::{DownloadError, Result};
use super::models::{PlaylistInfo, ProgressEvent};
use super::orchestrator::{CancelFlag, DownloadContext};
use super::tools::RuntimePaths;
use super::traits::{EngineInvocation, EngineOutcome, ExtractionEngine, ProgressSink, SinkControl};

/// One scripted engine call
#[derive(Debug, Clone)]
pub enum Step {
    /// Emit one progress event, then finish as `<video id>.mp4`
    Succeed,
    /// Fail with this engine error text
    Fail(&'static str),
    /// Poll the sink until it asks to cancel
    WaitForCancel,
    /// Set the flag, then fail as if the process had been killed
    CancelThenFail(CancelFlag, &'static str),
    /// Finish normally, then set the flag
    SucceedThenCancel(CancelFlag),
}

/// Engine that replays scripted steps and records every invocation
#[derive(Default)]
pub struct ScriptedEngine {
    default_script: Mutex<VecDeque<Step>>,
    per_url: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<EngineInvocation>>,
    playlist: Mutex<Option<PlaylistInfo>>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            default_script: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    /// Steps consumed only by calls for `url`
    pub fn script_for(self, url: &str, steps: Vec<Step>) -> Self {
        self.per_url.lock().unwrap().insert(url.to_string(), steps.into());
        self
    }

    pub fn with_playlist(self, playlist: PlaylistInfo) -> Self {
        *self.playlist.lock().unwrap() = Some(playlist);
        self
    }

    pub fn calls(&self) -> Vec<EngineInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_step(&self, url: &str) -> Step {
        if let Some(step) = self.per_url.lock().unwrap().get_mut(url).and_then(VecDeque::pop_front) {
            return step;
        }
        self.default_script.lock().unwrap().pop_front().unwrap_or(Step::Succeed)
    }
}

fn video_id(url: &str) -> String {
    url.rsplit(['=', '/']).next().unwrap_or("video").to_string()
}

#[async_trait]
impl ExtractionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn download(&self, invocation: &EngineInvocation, sink: &dyn ProgressSink) -> Result<EngineOutcome> {
        self.calls.lock().unwrap().push(invocation.clone());
        let filename = Some(format!("{}.mp4", video_id(&invocation.url)));

        match self.next_step(&invocation.url) {
            Step::Succeed => {
                let control = sink.emit(ProgressEvent::Downloading {
                    percentage: 50.0,
                    speed: Some("1.00MiB/s".to_string()),
                    eta: Some("00:01".to_string()),
                    downloaded_bytes: Some(512),
                    total_bytes: Some(1024),
                });
                if control == SinkControl::Cancel {
                    return Ok(EngineOutcome::Cancelled);
                }
                Ok(EngineOutcome::Completed { filename })
            }
            Step::Fail(message) => Err(DownloadError::Engine(message.to_string())),
            Step::WaitForCancel => loop {
                if sink.poll() == SinkControl::Cancel {
                    return Ok(EngineOutcome::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
            Step::CancelThenFail(flag, message) => {
                flag.cancel();
                Err(DownloadError::Engine(message.to_string()))
            }
            Step::SucceedThenCancel(flag) => {
                flag.cancel();
                Ok(EngineOutcome::Completed { filename })
            }
        }
    }

    async fn extract_playlist(&self, invocation: &EngineInvocation) -> Result<Option<PlaylistInfo>> {
        self.calls.lock().unwrap().push(invocation.clone());
        Ok(self.playlist.lock().unwrap().clone())
    }
}

impl EngineInvocation {
    /// Browser name if cookies come from a browser
    pub fn credentials_name(&self) -> Option<&str> {
        match &self.credentials {
            CredentialSource::Browser { choice, .. } => Some(choice.name.as_str()),
            _ => None,
        }
    }
}

/// Probe that treats every browser in the table as installed and idle
pub struct AllInstalled;

impl BrowserProbe for AllInstalled {
    fn is_installed(&self, _browser: &BrowserSpec) -> bool {
        true
    }

    fn is_running(&self, _browser: &BrowserSpec) -> bool {
        false
    }
}

fn base_config() -> DownloaderConfig {
    DownloaderConfig {
        cookie_files: CookieFileLocations::new(Vec::new()),
        browsers: BrowserTable::new(Vec::new()),
        ..DownloaderConfig::default()
    }
}

fn runtimes() -> RuntimePaths {
    RuntimePaths {
        ffmpeg_dir: Some(PathBuf::from("/opt/tools")),
        js_runtime: None,
    }
}

/// Anonymous context around `engine`
pub fn test_context(engine: Arc<ScriptedEngine>) -> Arc<DownloadContext> {
    test_context_with_browsers(engine, &[])
}

/// Context whose browser table holds `names`, all installed
pub fn test_context_with_browsers(engine: Arc<ScriptedEngine>, names: &[&str]) -> Arc<DownloadContext> {
    let mut config = base_config();
    config.browsers = BrowserTable::new(
        names
            .iter()
            .map(|name| BrowserSpec {
                name: name.to_string(),
                family: BrowserFamily::Gecko,
                profile_paths: Vec::new(),
                process_names: Vec::new(),
                locks_cookie_store: false,
            })
            .collect(),
    );
    Arc::new(DownloadContext::new(config, engine, Arc::new(AllInstalled), runtimes()).unwrap())
}
