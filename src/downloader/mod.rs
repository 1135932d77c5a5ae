// Downloader module - orchestration around the extraction engine

pub mod backends;
pub mod config;
pub mod credentials;
pub mod diagnostics;
pub mod errors;
pub mod format_selector;
pub mod manager;
pub mod mix_guard;
pub mod models;
pub mod orchestrator;
pub mod playlist;
pub mod preflight;
pub mod tools;
pub mod traits;
pub mod utils;
pub mod validators;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DownloaderConfig, NetworkConfig, RetryPolicy};
pub use credentials::{CredentialNegotiator, CredentialSource, NegotiatedCredentials};
pub use diagnostics::{classify_error, ErrorCategory, ErrorClassification};
pub use errors::{DownloadError, Result};
pub use format_selector::{FormatResolver, FormatSpec};
pub use manager::{DownloadManager, JobId, ManagerMessage, MessageKind};
pub use mix_guard::{MixPlaylistGuard, PlaylistPolicy};
pub use models::{BatchResult, DownloadRequest, ItemStatus, PlaylistInfo, PlaylistItem, PlaylistMode, ProgressEvent};
pub use orchestrator::{CancelFlag, DownloadContext, DownloadOrchestrator, DownloadReport, RetryState};
pub use playlist::PlaylistBatchOrchestrator;
pub use preflight::{run_preflight_checks, PreflightResult};
pub use tools::{RuntimeInventory, RuntimeLocator, ToolId};
pub use traits::{ExtractionEngine, ProgressSink, SinkControl};
pub use validators::{sanitize_filename, UrlValidator};
