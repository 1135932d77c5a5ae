// Extraction engine and progress sink traits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;

use super::config::{EngineConfig, NetworkConfig};
use super::credentials::CredentialSource;
use super::errors::Result;
use super::format_selector::FormatSpec;
use super::mix_guard::PlaylistPolicy;
use super::models::{PlaylistInfo, ProgressEvent};
use super::tools::RuntimePaths;

/// Fully resolved options for one engine call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInvocation {
    pub url: String,
    pub format: FormatSpec,
    pub output_dir: PathBuf,
    pub credentials: CredentialSource,
    pub user_agent: String,
    pub playlist: PlaylistPolicy,
    pub runtimes: RuntimePaths,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
}

/// How an engine call ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineOutcome {
    /// Finished; final output file if the engine reported one
    Completed { filename: Option<String> },
    /// Aborted because the sink asked to stop
    Cancelled,
}

/// Sink answer after each event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    Cancel,
}

/// Receives progress events. Returning `Cancel` aborts the running attempt.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent) -> SinkControl;

    /// Polled periodically while the engine is quiet
    fn poll(&self) -> SinkControl {
        SinkControl::Continue
    }
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) -> SinkControl + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) -> SinkControl {
        self(event)
    }
}

/// Discards everything
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) -> SinkControl {
        SinkControl::Continue
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelSink {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) -> SinkControl {
        // Receiver gone means nobody is listening anymore
        match self.tx.send(event) {
            Ok(()) => SinkControl::Continue,
            Err(_) => SinkControl::Cancel,
        }
    }
}

/// Trait for extraction engine implementations
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// Name of the engine (for logging)
    fn name(&self) -> &'static str;

    /// Download with progress updates.
    ///
    /// Failures come back as `DownloadError::Engine` carrying the raw
    /// engine error text so the caller can classify it.
    async fn download(
        &self,
        invocation: &EngineInvocation,
        sink: &dyn ProgressSink,
    ) -> Result<EngineOutcome>;

    /// Flat playlist listing without downloading. `None` if the URL is not a playlist.
    async fn extract_playlist(&self, invocation: &EngineInvocation) -> Result<Option<PlaylistInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_sink() {
        let sink = |ev: ProgressEvent| match ev {
            ProgressEvent::Error { .. } => SinkControl::Cancel,
            _ => SinkControl::Continue,
        };
        assert_eq!(sink.emit(ProgressEvent::Complete { filename: "a".into() }), SinkControl::Continue);
        assert_eq!(sink.emit(ProgressEvent::Error { message: "x".into() }), SinkControl::Cancel);
        assert_eq!(sink.poll(), SinkControl::Continue);
    }

    #[test]
    fn test_channel_sink_cancels_when_receiver_dropped() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        assert_eq!(sink.emit(ProgressEvent::Complete { filename: "a".into() }), SinkControl::Continue);
        assert!(rx.try_recv().is_ok());

        drop(rx);
        assert_eq!(sink.emit(ProgressEvent::Complete { filename: "b".into() }), SinkControl::Cancel);
    }
}
