// Download orchestrator - retry state machine around the extraction engine
//
// Idle -> Attempting -> { Success | Backoff | FatalFailure }
// Backoff -> Attempting
// Terminal: Success, FatalFailure, Exhausted, Cancelled
//
// Fatal categories stop the loop at once. Recoverable ones back off
// exponentially with jitter until the attempt budget is spent.
// Cancellation is cooperative: checked before each attempt, during backoff,
// and inside the progress sink while an attempt runs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::backends::YtDlpEngine;
use super::config::DownloaderConfig;
use super::credentials::{BrowserProbe, CredentialNegotiator, NegotiatedCredentials, SystemBrowserProbe};
use super::diagnostics::{summarize_error, ErrorCategory, ErrorClassification};
use super::errors::{DownloadError, Result};
use super::format_selector::FormatResolver;
use super::mix_guard::MixPlaylistGuard;
use super::models::{DownloadRequest, ProgressEvent};
use super::tools::{RuntimeInventory, RuntimeLocator, RuntimePaths};
use super::traits::{EngineInvocation, EngineOutcome, ExtractionEngine, ProgressSink, SinkControl};

/// Cooperative cancellation flag, settable from any thread
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the owner can run again
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Wraps the caller's sink so a set cancel flag aborts the attempt
struct CancellableSink<'a> {
    inner: &'a dyn ProgressSink,
    cancel: &'a CancelFlag,
}

impl ProgressSink for CancellableSink<'_> {
    fn emit(&self, event: ProgressEvent) -> SinkControl {
        if self.cancel.is_cancelled() {
            return SinkControl::Cancel;
        }
        self.inner.emit(event)
    }

    fn poll(&self) -> SinkControl {
        if self.cancel.is_cancelled() {
            return SinkControl::Cancel;
        }
        self.inner.poll()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Idle,
    Attempting,
    Backoff,
    Success,
    FatalFailure,
    Exhausted,
    Cancelled,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::FatalFailure | Self::Exhausted | Self::Cancelled
        )
    }
}

/// What happened during one orchestration call
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub state: RetryState,
    /// Engine invocations made
    pub attempts: u32,
    /// Delays slept between attempts, in order
    pub backoff_delays: Vec<Duration>,
    pub filename: Option<String>,
    pub last_classification: Option<ErrorClassification>,
    /// Credential source used by the last attempt
    pub credential_source: String,
    /// Set for FatalFailure and Exhausted
    pub error: Option<DownloadError>,
}

impl DownloadReport {
    fn new() -> Self {
        Self {
            state: RetryState::Idle,
            attempts: 0,
            backoff_delays: Vec::new(),
            filename: None,
            last_classification: None,
            credential_source: String::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RetryState::Success
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == RetryState::Cancelled
    }

    /// Failures become `Err`, success and cancellation stay `Ok`
    pub fn into_result(self) -> Result<DownloadReport> {
        match self.error.clone() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Shared components. Read-only after construction, safe to share across
/// concurrent orchestrators.
pub struct DownloadContext {
    pub config: DownloaderConfig,
    pub resolver: FormatResolver,
    pub credentials: Arc<CredentialNegotiator>,
    pub mix_guard: MixPlaylistGuard,
    pub runtimes: RuntimePaths,
    pub engine: Arc<dyn ExtractionEngine>,
    pub inventory: Option<RuntimeInventory>,
}

impl DownloadContext {
    pub fn new(
        config: DownloaderConfig,
        engine: Arc<dyn ExtractionEngine>,
        probe: Arc<dyn BrowserProbe>,
        runtimes: RuntimePaths,
    ) -> Result<Self> {
        config.validate()?;

        let credentials = Arc::new(CredentialNegotiator::new(
            config.browsers.clone(),
            probe,
            config.user_agents.clone(),
            config.cookie_files.clone(),
        ));

        Ok(Self {
            resolver: FormatResolver::new(config.qualities.clone()),
            mix_guard: MixPlaylistGuard::new(config.mix_guard.clone()),
            credentials,
            runtimes,
            engine,
            inventory: None,
            config,
        })
    }

    /// Discover tools on this machine and wire up the yt-dlp engine.
    ///
    /// Fails if ffmpeg or yt-dlp cannot be found.
    pub async fn from_system(config: DownloaderConfig) -> Result<Self> {
        let locator = RuntimeLocator::new(&config.locator);
        let inventory = RuntimeInventory::discover(&locator).await?;
        let engine = Arc::new(YtDlpEngine::from_inventory(&inventory)?);

        let mut ctx = Self::new(
            config,
            engine,
            Arc::new(SystemBrowserProbe::new()),
            inventory.runtime_paths(),
        )?;
        ctx.inventory = Some(inventory);
        Ok(ctx)
    }

    /// Run credential negotiation off the async runtime
    pub async fn negotiate_credentials(&self) -> Result<NegotiatedCredentials> {
        let negotiator = Arc::clone(&self.credentials);
        tokio::task::spawn_blocking(move || negotiator.negotiate())
            .await
            .map_err(|e| DownloadError::ExecutionError(format!("credential negotiation failed: {}", e)))
    }
}

/// Drives one request at a time through the retry loop
pub struct DownloadOrchestrator {
    ctx: Arc<DownloadContext>,
    cancel: CancelFlag,
    state: RetryState,
}

impl DownloadOrchestrator {
    pub fn new(ctx: Arc<DownloadContext>) -> Self {
        Self::with_cancel_flag(ctx, CancelFlag::new())
    }

    pub fn with_cancel_flag(ctx: Arc<DownloadContext>, cancel: CancelFlag) -> Self {
        Self {
            ctx,
            cancel,
            state: RetryState::Idle,
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn context(&self) -> &Arc<DownloadContext> {
        &self.ctx
    }

    fn transition(&mut self, report: &mut DownloadReport, next: RetryState) {
        debug!("[Downloader] {:?} -> {:?}", self.state, next);
        self.state = next;
        report.state = next;
    }

    /// Sleep for `delay`, returning false if cancelled first
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Convenience wrapper: `Ok(true)` on success, `Ok(false)` if cancelled,
    /// `Err` for fatal or exhausted failures.
    pub async fn download(&mut self, request: &DownloadRequest, sink: &dyn ProgressSink) -> Result<bool> {
        let report = self.run(request, sink).await?.into_result()?;
        Ok(report.is_success())
    }

    /// Run the retry loop for one request.
    ///
    /// `Err` is reserved for setup problems; download failures are reported
    /// in `DownloadReport::state` and `DownloadReport::error`. A cancellation
    /// is consumed by the run it stops, so the next run starts clean.
    pub async fn run(&mut self, request: &DownloadRequest, sink: &dyn ProgressSink) -> Result<DownloadReport> {
        let report = self.retry_loop(request, sink).await?;
        if report.is_cancelled() {
            self.cancel.reset();
        }
        Ok(report)
    }

    async fn retry_loop(&mut self, request: &DownloadRequest, sink: &dyn ProgressSink) -> Result<DownloadReport> {
        let ctx = Arc::clone(&self.ctx);
        let mut report = DownloadReport::new();
        self.transition(&mut report, RetryState::Idle);

        let max_attempts = request.max_retries.max(1);
        let format = ctx.resolver.resolve(&request.quality, request.audio_only);
        let playlist = ctx.mix_guard.policy_for(&request.url, request.playlist_mode);

        if self.cancel.is_cancelled() {
            info!("[Downloader] Cancelled before start: {}", request.url);
            self.transition(&mut report, RetryState::Cancelled);
            return Ok(report);
        }

        let mut creds = ctx.negotiate_credentials().await?;
        info!(
            "[Downloader] {} | quality={} format={} | {}",
            request.url,
            request.quality,
            format.format,
            creds.source.describe()
        );

        let cancel = self.cancel.clone();
        let guarded = CancellableSink {
            inner: sink,
            cancel: &cancel,
        };
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                self.transition(&mut report, RetryState::Cancelled);
                return Ok(report);
            }

            if attempt > 1 {
                let delay = ctx.config.retry.delay_for_retry(attempt - 1);
                self.transition(&mut report, RetryState::Backoff);
                report.backoff_delays.push(delay);
                info!(
                    "[Downloader] Retry {}/{} in {:.1}s",
                    attempt,
                    max_attempts,
                    delay.as_secs_f64()
                );
                if !self.backoff(delay).await {
                    info!("[Downloader] Cancelled during backoff");
                    self.transition(&mut report, RetryState::Cancelled);
                    return Ok(report);
                }
            }

            self.transition(&mut report, RetryState::Attempting);
            report.attempts = attempt;
            report.credential_source = creds.source.describe();

            let invocation = EngineInvocation {
                url: request.url.clone(),
                format: format.clone(),
                output_dir: request.output_dir.clone(),
                credentials: creds.source.clone(),
                user_agent: creds.user_agent.clone(),
                playlist,
                runtimes: ctx.runtimes.clone(),
                network: ctx.config.network.clone(),
                engine: ctx.config.engine.clone(),
            };

            debug!("[Downloader] Attempt {}/{} via {}", attempt, max_attempts, ctx.engine.name());

            match ctx.engine.download(&invocation, &guarded).await {
                Ok(EngineOutcome::Completed { filename }) => {
                    info!("[Downloader] ✓ Download complete after {} attempt(s)", attempt);
                    sink.emit(ProgressEvent::Complete {
                        filename: filename.clone().unwrap_or_default(),
                    });
                    report.filename = filename;
                    self.transition(&mut report, RetryState::Success);
                    return Ok(report);
                }
                Ok(EngineOutcome::Cancelled) => {
                    info!("[Downloader] Download cancelled by user");
                    self.transition(&mut report, RetryState::Cancelled);
                    return Ok(report);
                }
                Err(e) => {
                    // An attempt torn down by cancellation is not a failure
                    if self.cancel.is_cancelled() {
                        self.transition(&mut report, RetryState::Cancelled);
                        return Ok(report);
                    }

                    let classification = e.classification();
                    let message = e.to_string();
                    report.last_classification = Some(classification);

                    if classification.is_fatal() {
                        warn!(
                            "[Downloader] ✗ Fatal {}: {}",
                            classification.category,
                            summarize_error(&message)
                        );
                        let err = DownloadError::Fatal {
                            classification,
                            message: summarize_error(&message),
                        };
                        sink.emit(ProgressEvent::Error {
                            message: err.to_string(),
                        });
                        report.error = Some(err);
                        self.transition(&mut report, RetryState::FatalFailure);
                        return Ok(report);
                    }

                    warn!(
                        "[Downloader] ✗ Attempt {}/{} failed ({}): {}",
                        attempt,
                        max_attempts,
                        classification.category.user_message(),
                        summarize_error(&message)
                    );

                    if classification.category.credentials_might_help() {
                        if let Some(next) = creds.next_fallback(ctx.credentials.user_agents()) {
                            info!(
                                "[Downloader] Switching cookies: {} -> {}",
                                creds.source.describe(),
                                next.source.describe()
                            );
                            creds = next;
                        }
                    }

                    last_message = message;
                }
            }
        }

        let last = report
            .last_classification
            .unwrap_or_else(|| ErrorClassification::new(ErrorCategory::Unknown));
        let err = DownloadError::Exhausted {
            attempts: max_attempts,
            last,
            message: summarize_error(&last_message),
        };
        warn!("[Downloader] ✗ {}", err);
        sink.emit(ProgressEvent::Error {
            message: err.to_string(),
        });
        report.error = Some(err);
        self.transition(&mut report, RetryState::Exhausted);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{test_context, test_context_with_browsers, ScriptedEngine, Step};
    use crate::downloader::traits::NullSink;
    use std::sync::Mutex;

    fn request() -> DownloadRequest {
        DownloadRequest::new("https://example.test/watch?v=abc", "/tmp/out")
            .with_quality("720p")
            .with_max_retries(3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_rate_limits_then_success() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::Fail("HTTP Error 429: too many requests"),
            Step::Fail("429 too many requests"),
            Step::Succeed,
        ]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));

        let report = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(report.state, RetryState::Success);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.backoff_delays.len(), 2);
        assert!(report.backoff_delays[0] >= Duration::from_secs(2));
        assert!(report.backoff_delays[0] <= Duration::from_secs(3));
        assert!(report.backoff_delays[1] >= Duration::from_secs(4));
        assert!(report.backoff_delays[1] <= Duration::from_secs(6));
        assert_eq!(report.last_classification.unwrap().category, ErrorCategory::RateLimited);
        assert!(report.error.is_none());
        assert_eq!(engine.call_count(), 3);
        assert_eq!(orch.state(), RetryState::Success);

        let inv = &engine.calls()[0];
        assert_eq!(inv.format.format, "bv*[height<=720]+ba/b[height<=720]/bv*+ba/best");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drm_warning_does_not_mask_rate_limit() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::Fail(
                "WARNING: [youtube] abc: Some tv client https formats have been skipped as they are DRM protected\n\
                 ERROR: [youtube] abc: HTTP Error 429: Too Many Requests",
            ),
            Step::Succeed,
        ]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));

        let report = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(report.state, RetryState::Success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.backoff_delays.len(), 1);
        assert_eq!(report.last_classification.unwrap().category, ErrorCategory::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_is_fatal_immediately() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::Fail("ERROR: This video is unavailable"),
            Step::Succeed,
        ]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));

        let report = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(report.state, RetryState::FatalFailure);
        assert_eq!(report.attempts, 1);
        assert!(report.backoff_delays.is_empty());
        assert_eq!(engine.call_count(), 1);

        let err = report.into_result().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("private/removed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drm_makes_exactly_one_attempt() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Fail("This video is DRM protected")]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));

        let err = orch.download(&request().with_max_retries(5), &NullSink).await.unwrap_err();
        assert_eq!(err.classification().category, ErrorCategory::DrmProtected);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_names_last_cause() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::Fail("HTTP Error 429"),
            Step::Fail("HTTP Error 429"),
            Step::Fail("Read timed out"),
        ]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));

        let events = Mutex::new(Vec::new());
        let sink = |ev: ProgressEvent| {
            events.lock().unwrap().push(ev);
            SinkControl::Continue
        };
        let report = orch.run(&request(), &sink).await.unwrap();
        assert_eq!(report.state, RetryState::Exhausted);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.backoff_delays.len(), 2);
        match report.error {
            Some(DownloadError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.category, ErrorCategory::Network);
            }
            other => panic!("expected exhausted error, got {:?}", other),
        }
        assert!(matches!(events.lock().unwrap().last(), Some(ProgressEvent::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_still_attempts_once() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Fail("HTTP Error 429")]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));

        let report = orch.run(&request().with_max_retries(0), &NullSink).await.unwrap();
        assert_eq!(report.state, RetryState::Exhausted);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_attempt_is_cancelled_not_failed() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::WaitForCancel]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));
        let flag = orch.cancel_flag();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.cancel();
        });

        let report = orch.run(&request(), &NullSink).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(report.state, RetryState::Cancelled);
        assert_eq!(report.attempts, 1);
        assert!(report.error.is_none());
        assert!(report.backoff_delays.is_empty());
        assert!(report.clone().into_result().is_ok());
    }

    #[tokio::test]
    async fn test_engine_error_after_cancel_is_not_a_failure() {
        let flag = CancelFlag::new();
        let engine = Arc::new(ScriptedEngine::new(vec![Step::CancelThenFail(flag.clone(), "connection reset")]));
        let mut orch = DownloadOrchestrator::with_cancel_flag(test_context(engine.clone()), flag);

        let report = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(report.state, RetryState::Cancelled);
        assert!(report.last_classification.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_engine() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Succeed]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));
        orch.cancel();

        let report = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(report.state, RetryState::Cancelled);
        assert_eq!(report.attempts, 0);
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test]
    async fn test_orchestrator_reusable_after_cancel() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Succeed]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));
        let flag = orch.cancel_flag();
        orch.cancel();

        let first = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(first.state, RetryState::Cancelled);
        assert!(!flag.is_cancelled());

        let second = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(second.state, RetryState::Success);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Fail("HTTP Error 429"), Step::Succeed]));
        let mut orch = DownloadOrchestrator::new(test_context(engine.clone()));
        let flag = orch.cancel_flag();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            flag.cancel();
        });

        let report = orch.run(&request(), &NullSink).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(report.state, RetryState::Cancelled);
        assert_eq!(report.backoff_delays.len(), 1);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bot_detection_rotates_to_fallback_browser() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::Fail("Sign in to confirm you're not a bot"),
            Step::Succeed,
        ]));
        let ctx = test_context_with_browsers(engine.clone(), &["b1", "b2"]);
        let mut orch = DownloadOrchestrator::new(ctx);

        let report = orch.run(&request(), &NullSink).await.unwrap();
        assert_eq!(report.state, RetryState::Success);

        let calls = engine.calls();
        assert_eq!(calls[0].credentials_name(), Some("b1"));
        assert_eq!(calls[1].credentials_name(), Some("b2"));
        assert_eq!(report.credential_source, "browser:b2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_keeps_same_browser() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Fail("HTTP Error 429"), Step::Succeed]));
        let ctx = test_context_with_browsers(engine.clone(), &["b1", "b2"]);
        let mut orch = DownloadOrchestrator::new(ctx);

        orch.run(&request(), &NullSink).await.unwrap();
        let calls = engine.calls();
        assert_eq!(calls[1].credentials_name(), Some("b1"));
    }

    #[tokio::test]
    async fn test_success_emits_complete_event() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Succeed]));
        let mut orch = DownloadOrchestrator::new(test_context(engine));

        let events = Mutex::new(Vec::new());
        let sink = |ev: ProgressEvent| {
            events.lock().unwrap().push(ev);
            SinkControl::Continue
        };
        assert!(orch.download(&request(), &sink).await.unwrap());

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(ProgressEvent::Downloading { .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { filename }) if filename == "abc.mp4"));
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::task::yield_now().await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        flag.reset();
        assert!(!flag.is_cancelled());
    }
}
