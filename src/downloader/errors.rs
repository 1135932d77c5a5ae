// Error types for the download orchestration layer

use thiserror::Error;

use super::diagnostics::{classify_error, error_lines, ErrorClassification};
use super::models::ItemStatus;

#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Required external tool (ffmpeg, yt-dlp) could not be located
    #[error("Tool not found: {tool}. {hint}")]
    ToolNotFound { tool: String, hint: String },

    /// URL rejected before any download attempt
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to parse engine output
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Could not start or wait for a subprocess
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Raw failure text reported by the extraction engine
    #[error("{0}")]
    Engine(String),

    /// Non-recoverable failure, retry loop short-circuited
    #[error("Download failed: {} ({}). {}", .classification.category.user_message(), .message, .classification.category.suggestion())]
    Fatal {
        classification: ErrorClassification,
        message: String,
    },

    /// Every attempt failed with a recoverable error
    #[error("All {attempts} download attempts failed. Last error ({}): {message}", .last.category)]
    Exhausted {
        attempts: u32,
        last: ErrorClassification,
        message: String,
    },

    /// Playlist item status moved backwards or out of a terminal state
    #[error("Invalid status transition for item {index}: {from:?} -> {to:?}")]
    InvalidTransition {
        index: usize,
        from: ItemStatus,
        to: ItemStatus,
    },

    /// Rejected configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DownloadError {
    pub fn tool_not_found(tool: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::ToolNotFound {
            tool: tool.into(),
            hint: hint.into(),
        }
    }

    /// Classification of this error for the retry loop.
    pub fn classification(&self) -> ErrorClassification {
        match self {
            Self::Fatal { classification, .. } => *classification,
            Self::Exhausted { last, .. } => *last,
            Self::Engine(message) => classify_error(&error_lines(message)),
            other => classify_error(&other.to_string()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// Raw strings come from engine stderr
impl From<String> for DownloadError {
    fn from(s: String) -> Self {
        Self::Engine(s)
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
