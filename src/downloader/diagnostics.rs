// Failure diagnostics - classifies extraction engine errors
//
// Maps raw error text to a category and decides whether the retry loop
// should back off and try again or give up immediately.
// Matching is ordered: the first rule that hits wins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an extraction attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Video deleted, private or otherwise gone
    VideoUnavailable,

    /// Copyright or regional restriction
    GeoBlocked,

    /// DRM-protected content
    DrmProtected,

    /// HTTP 403
    Forbidden,

    /// Anti-bot challenge ("Sign in to confirm you're not a bot")
    BotDetection,

    /// HTTP 429 or similar throttling
    RateLimited,

    /// Timeouts and dropped connections
    Network,

    /// Nothing matched
    Unknown,
}

impl ErrorCategory {
    /// Whether the retry loop should back off and try again.
    ///
    /// `Unknown` is treated as transient. A permanent failure that matches no
    /// rule will therefore burn through every attempt before surfacing.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::VideoUnavailable | Self::GeoBlocked | Self::DrmProtected
        )
    }

    /// Whether switching to another cookie source might help
    pub fn credentials_might_help(&self) -> bool {
        matches!(self, Self::Forbidden | Self::BotDetection)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoUnavailable => "video_unavailable",
            Self::GeoBlocked => "geo_blocked",
            Self::DrmProtected => "drm_protected",
            Self::Forbidden => "forbidden",
            Self::BotDetection => "bot_detection",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Short human-readable message for UI/log output
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::VideoUnavailable => "video is private/removed",
            Self::GeoBlocked => "video is blocked in your country or for copyright",
            Self::DrmProtected => "video is DRM-protected and cannot be downloaded",
            Self::Forbidden => "access denied (HTTP 403), retrying",
            Self::BotDetection => "site requested bot verification, retrying",
            Self::RateLimited => "temporarily rate-limited, retrying",
            Self::Network => "network problem, retrying",
            Self::Unknown => "unexpected error, retrying",
        }
    }

    /// Longer suggestion shown once the error surfaces to the user
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::VideoUnavailable => {
                "It may have been deleted by the uploader, removed for copyright, or made private."
            }
            Self::GeoBlocked => "Try a VPN or proxy located in a region where the video is allowed.",
            Self::DrmProtected => {
                "This is a content protection measure, not an error. It cannot be downloaded as a file."
            }
            Self::Forbidden => "Close your browser so its cookies can be read, or export cookies.txt.",
            Self::BotDetection => "Use cookies from a logged-in browser or a fresh network.",
            Self::RateLimited => "Wait 10-15 minutes or use a different network.",
            Self::Network => "Check your internet connection and try again.",
            Self::Unknown => "Check the URL and try again later.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category plus the retry decision derived from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub recoverable: bool,
}

impl ErrorClassification {
    pub fn new(category: ErrorCategory) -> Self {
        Self {
            category,
            recoverable: category.is_recoverable(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        !self.recoverable
    }
}

/// Ordered substring rules, matched against lowercased error text
const CLASSIFICATION_RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::VideoUnavailable,
        &["unavailable", "private", "deleted", "removed"],
    ),
    (
        ErrorCategory::GeoBlocked,
        &["copyright", "blocked", "not available in your country"],
    ),
    (ErrorCategory::DrmProtected, &["drm", "protected"]),
    (ErrorCategory::Forbidden, &["403", "forbidden"]),
    (ErrorCategory::BotDetection, &["bot", "sign in", "confirm you"]),
    (ErrorCategory::RateLimited, &["429", "too many", "rate limit"]),
    (ErrorCategory::Network, &["timeout", "timed out", "connection"]),
];

/// Classify raw error text. Pure function of its input.
pub fn classify_error(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();

    let category = CLASSIFICATION_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown);

    ErrorClassification::new(category)
}

/// The part of engine stderr that names the failure: every `ERROR:` line,
/// else the last non-empty line. `WARNING:` chatter is never included.
pub fn error_lines(stderr: &str) -> String {
    let errors: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("ERROR:"))
        .collect();

    if !errors.is_empty() {
        return errors.join("\n");
    }

    stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// One-line preview of a (possibly multi-line) engine error for logs.
///
/// Prefers `ERROR:` / HTTP lines, falls back to the last non-empty line.
pub fn summarize_error(stderr: &str) -> String {
    let important: Vec<&str> = stderr
        .lines()
        .map(|l| l.trim())
        .filter(|l| l.starts_with("ERROR:") || l.contains("HTTP Error"))
        .take(2)
        .collect();

    if !important.is_empty() {
        return important.join(" | ");
    }

    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().chars().take(100).collect())
        .unwrap_or_else(|| "Unknown error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_lines_do_not_drive_classification() {
        let stderr = "WARNING: [youtube] abc: Some tv client https formats have been skipped as they are DRM protected\n\
                      ERROR: [youtube] abc: HTTP Error 429: Too Many Requests";
        assert_eq!(error_lines(stderr), "ERROR: [youtube] abc: HTTP Error 429: Too Many Requests");
        assert_eq!(classify_error(&error_lines(stderr)).category, ErrorCategory::RateLimited);

        assert_eq!(error_lines("WARNING: private\nconnection reset\n\n"), "connection reset");
        assert_eq!(error_lines(""), "");
    }

    #[test]
    fn test_403_detection() {
        let c = classify_error("ERROR: unable to download video data: HTTP Error 403: Forbidden");
        assert_eq!(c.category, ErrorCategory::Forbidden);
        assert!(c.recoverable);
    }

    #[test]
    fn test_403_anywhere_in_text() {
        for msg in ["403", "got 403 from cdn", "HTTP 403", "status=403;"] {
            let c = classify_error(msg);
            assert_eq!(c.category, ErrorCategory::Forbidden, "{msg}");
            assert!(c.recoverable);
        }
    }

    #[test]
    fn test_drm_any_case() {
        for msg in ["DRM", "drm", "This video uses Drm", "dRm scheme"] {
            let c = classify_error(msg);
            assert_eq!(c.category, ErrorCategory::DrmProtected, "{msg}");
            assert!(!c.recoverable);
        }
    }

    #[test]
    fn test_unavailable_is_fatal() {
        let c = classify_error("ERROR: [youtube] abc: This video is unavailable");
        assert_eq!(c.category, ErrorCategory::VideoUnavailable);
        assert!(c.is_fatal());
    }

    #[test]
    fn test_geo_detection() {
        for msg in [
            "ERROR: [youtube] abc: Video not available in your country",
            "Who has blocked it in your country on copyright grounds",
        ] {
            let c = classify_error(msg);
            assert_eq!(c.category, ErrorCategory::GeoBlocked, "{msg}");
            assert!(!c.recoverable);
        }
    }

    #[test]
    fn test_bot_detection() {
        let c = classify_error("Sign in to confirm you're not a bot");
        assert_eq!(c.category, ErrorCategory::BotDetection);
        assert!(c.category.credentials_might_help());
    }

    #[test]
    fn test_rate_limit_detection() {
        let c = classify_error("HTTP Error 429: Too Many Requests");
        assert_eq!(c.category, ErrorCategory::RateLimited);
        assert!(c.recoverable);
    }

    #[test]
    fn test_timeout_detection() {
        let c = classify_error("Read timed out.");
        assert_eq!(c.category, ErrorCategory::Network);
    }

    #[test]
    fn test_first_rule_wins() {
        // "private" is checked before "403"
        let c = classify_error("HTTP Error 403 while fetching private video");
        assert_eq!(c.category, ErrorCategory::VideoUnavailable);
    }

    #[test]
    fn test_unknown_defaults_to_recoverable() {
        let c = classify_error("something odd happened");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.recoverable);
        assert_eq!(classify_error("").category, ErrorCategory::Unknown);
    }

    #[test]
    fn test_summarize_prefers_error_lines() {
        let stderr = "[youtube] abc: Downloading webpage\nERROR: HTTP Error 429: Too Many Requests\n";
        assert_eq!(summarize_error(stderr), "ERROR: HTTP Error 429: Too Many Requests");
        assert_eq!(summarize_error("\nlast line\n\n"), "last line");
        assert_eq!(summarize_error(""), "Unknown error");
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::BotDetection).unwrap();
        assert_eq!(json, "\"bot_detection\"");
    }
}
