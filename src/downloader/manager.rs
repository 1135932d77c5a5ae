// Background download manager
//
// One tokio task per request, each with its own orchestrator. Workers never
// touch foreground state; everything flows back through one message queue
// the foreground drains with `poll()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::models::{DownloadRequest, ProgressEvent};
use super::orchestrator::{CancelFlag, DownloadContext, DownloadOrchestrator, DownloadReport};
use super::traits::{ProgressSink, SinkControl};
use super::validators::UrlValidator;

/// How long `shutdown` waits for each worker
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub type JobId = u64;

#[derive(Debug, Clone)]
pub enum MessageKind {
    Status(String),
    Progress(ProgressEvent),
    Complete(DownloadReport),
    Error(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ManagerMessage {
    pub job: JobId,
    pub kind: MessageKind,
}

impl ManagerMessage {
    /// Last message a job sends
    pub fn is_final(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Complete(_) | MessageKind::Error(_) | MessageKind::Cancelled
        )
    }
}

/// Forwards engine progress into the manager queue
struct QueueSink {
    job: JobId,
    tx: UnboundedSender<ManagerMessage>,
}

impl QueueSink {
    fn send(&self, kind: MessageKind) -> bool {
        self.tx.send(ManagerMessage { job: self.job, kind }).is_ok()
    }
}

impl ProgressSink for QueueSink {
    fn emit(&self, event: ProgressEvent) -> SinkControl {
        if self.send(MessageKind::Progress(event)) {
            SinkControl::Continue
        } else {
            SinkControl::Cancel
        }
    }
}

struct Job {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

pub struct DownloadManager {
    ctx: Arc<DownloadContext>,
    tx: UnboundedSender<ManagerMessage>,
    rx: UnboundedReceiver<ManagerMessage>,
    jobs: HashMap<JobId, Job>,
    next_id: JobId,
}

impl DownloadManager {
    pub fn new(ctx: Arc<DownloadContext>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            tx,
            rx,
            jobs: HashMap::new(),
            next_id: 1,
        }
    }

    /// Start a download in the background. Must be called inside a tokio runtime.
    pub fn submit(&mut self, request: DownloadRequest) -> JobId {
        let job = self.next_id;
        self.next_id += 1;

        let cancel = CancelFlag::new();
        let sink = QueueSink {
            job,
            tx: self.tx.clone(),
        };
        let orchestrator = DownloadOrchestrator::with_cancel_flag(Arc::clone(&self.ctx), cancel.clone());

        info!("[Manager] Job {} submitted: {}", job, request.url);
        let handle = tokio::spawn(run_job(orchestrator, request, sink));
        self.jobs.insert(job, Job { cancel, handle });
        job
    }

    /// Drain queued messages without blocking, forgetting finished jobs
    pub fn poll(&mut self) -> Vec<ManagerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            messages.push(msg);
        }
        self.jobs.retain(|_, j| !j.handle.is_finished());
        messages
    }

    /// Wait for the next message
    pub async fn next_message(&mut self) -> Option<ManagerMessage> {
        self.rx.recv().await
    }

    /// Request cancellation of one job. False if the job is unknown or done.
    pub fn cancel(&self, job: JobId) -> bool {
        match self.jobs.get(&job) {
            Some(j) if !j.handle.is_finished() => {
                info!("[Manager] Cancelling job {}", job);
                j.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) {
        for j in self.jobs.values() {
            j.cancel.cancel();
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.values().filter(|j| !j.handle.is_finished()).count()
    }

    /// Cancel everything and wait briefly for workers to wind down
    pub async fn shutdown(mut self) {
        self.cancel_all();
        for (id, job) in self.jobs.drain() {
            let abort = job.handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, job.handle).await {
                Ok(_) => debug!("[Manager] Job {} stopped", id),
                Err(_) => {
                    warn!("[Manager] Job {} did not stop in time, aborting", id);
                    abort.abort();
                }
            }
        }
    }
}

async fn run_job(mut orchestrator: DownloadOrchestrator, request: DownloadRequest, sink: QueueSink) {
    sink.send(MessageKind::Status("Validating URL...".to_string()));
    let url = match UrlValidator::validate(&request.url) {
        Ok(url) => url,
        Err(e) => {
            warn!("[Manager] Job {} rejected: {}", sink.job, e);
            sink.send(MessageKind::Error(e.to_string()));
            return;
        }
    };

    let request = DownloadRequest { url, ..request };
    sink.send(MessageKind::Status(format!("Downloading {}", request.url)));

    let kind = match orchestrator.run(&request, &sink).await {
        Ok(report) if report.is_cancelled() => MessageKind::Cancelled,
        Ok(report) => match &report.error {
            Some(e) => MessageKind::Error(e.to_string()),
            None => MessageKind::Complete(report),
        },
        Err(e) => MessageKind::Error(e.to_string()),
    };
    sink.send(kind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{test_context, ScriptedEngine, Step};

    fn request(id: &str) -> DownloadRequest {
        DownloadRequest::new(format!("https://example.test/watch?v={}", id), "/tmp/out")
    }

    /// Collect messages until `job` sends its final one
    async fn collect(manager: &mut DownloadManager, job: JobId) -> Vec<MessageKind> {
        let mut kinds = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), manager.next_message())
                .await
                .unwrap()
                .unwrap();
            if msg.job != job {
                continue;
            }
            let done = msg.is_final();
            kinds.push(msg.kind);
            if done {
                return kinds;
            }
        }
    }

    #[tokio::test]
    async fn test_job_reports_status_progress_complete() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Succeed]));
        let mut manager = DownloadManager::new(test_context(engine));

        let job = manager.submit(request("abc"));
        let kinds = collect(&mut manager, job).await;

        assert!(matches!(kinds.first(), Some(MessageKind::Status(s)) if s.starts_with("Validating")));
        assert!(kinds.iter().any(|k| matches!(k, MessageKind::Progress(ProgressEvent::Downloading { .. }))));
        match kinds.last() {
            Some(MessageKind::Complete(report)) => {
                assert!(report.is_success());
                assert_eq!(report.filename.as_deref(), Some("abc.mp4"));
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_url_never_reaches_engine() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let mut manager = DownloadManager::new(test_context(engine.clone()));

        let job = manager.submit(DownloadRequest::new("http://127.0.0.1/video", "/tmp/out"));
        let kinds = collect(&mut manager, job).await;

        assert!(matches!(kinds.last(), Some(MessageKind::Error(m)) if m.contains("Private/local")));
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_reported_as_error() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::Fail("Video unavailable")]));
        let mut manager = DownloadManager::new(test_context(engine));

        let job = manager.submit(request("gone"));
        let kinds = collect(&mut manager, job).await;
        assert!(matches!(kinds.last(), Some(MessageKind::Error(m)) if m.contains("private/removed")));
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::WaitForCancel]));
        let mut manager = DownloadManager::new(test_context(engine));

        let job = manager.submit(request("slow"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.cancel(job));

        let kinds = collect(&mut manager, job).await;
        assert!(matches!(kinds.last(), Some(MessageKind::Cancelled)));
        assert!(!manager.cancel(999));
    }

    #[tokio::test]
    async fn test_concurrent_jobs_and_poll() {
        let engine = Arc::new(ScriptedEngine::new(vec![]));
        let mut manager = DownloadManager::new(test_context(engine.clone()));

        let a = manager.submit(request("a"));
        let b = manager.submit(request("b"));
        assert_ne!(a, b);

        let mut finished = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while finished.len() < 2 && tokio::time::Instant::now() < deadline {
            for msg in manager.poll() {
                if msg.is_final() {
                    finished.push(msg.job);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        finished.sort();
        assert_eq!(finished, vec![a, b]);
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_jobs() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::WaitForCancel, Step::WaitForCancel]));
        let mut manager = DownloadManager::new(test_context(engine));
        manager.submit(request("a"));
        manager.submit(request("b"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.active_jobs(), 2);

        tokio::time::timeout(Duration::from_secs(3), manager.shutdown())
            .await
            .unwrap();
    }
}
