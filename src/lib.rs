// Media download orchestration core
//
// Drives an external extraction engine (yt-dlp) with retry, credential
// negotiation and playlist safety. Outer layers (GUI, CLI) call into
// `downloader` and render the events it produces.

pub mod downloader;
pub mod logging;

pub use downloader::{
    BatchResult, CancelFlag, DownloadContext, DownloadError, DownloadManager, DownloadOrchestrator,
    DownloadReport, DownloadRequest, DownloaderConfig, ErrorCategory, ErrorClassification,
    PlaylistBatchOrchestrator, PlaylistMode, ProgressEvent, ProgressSink, RetryState, SinkControl,
};
pub use logging::init_logging;
