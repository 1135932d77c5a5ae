// Input validation - URLs and file names

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use super::errors::{DownloadError, Result};

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Longest playlist directory name
const MAX_FILENAME_LEN: usize = 100;

lazy_static! {
    /// Shell metacharacter sequences. Plain parentheses stay allowed,
    /// they are common in URLs and titles.
    static ref SHELL_INJECTION_PATTERNS: Vec<Regex> = [
        r"\$\(",
        r"\$\{",
        r"`[^`]+`",
        r";\s*\w",
        r"\|\s*\w",
        r">\s*/",
        r"<\s*/",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect();

    static ref PRIVATE_HOST_PATTERNS: Vec<Regex> = [
        r"^localhost",
        r"^127\.",
        r"^10\.",
        r"^172\.(1[6-9]|2[0-9]|3[0-1])\.",
        r"^192\.168\.",
        r"^\[::1\]",
        r"^0\.0\.0\.0",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect();
}

/// Checks user-supplied URLs before they reach the engine command line
pub struct UrlValidator;

impl UrlValidator {
    /// Returns the trimmed URL if it is safe to hand to the engine
    pub fn validate(url: &str) -> Result<String> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::InvalidUrl("URL cannot be empty".to_string()));
        }

        let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("URL validation failed: {}", e)))?;

        if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
            return Err(DownloadError::InvalidUrl(format!(
                "Invalid URL scheme: {}. Only {} are allowed.",
                parsed.scheme(),
                ALLOWED_SCHEMES.join(", ")
            )));
        }

        let host = match parsed.host_str() {
            Some(h) if !h.is_empty() => h.to_lowercase(),
            _ => return Err(DownloadError::InvalidUrl("URL must have a valid domain".to_string())),
        };

        if PRIVATE_HOST_PATTERNS.iter().any(|re| re.is_match(&host)) {
            return Err(DownloadError::InvalidUrl(
                "Private/local addresses are not allowed".to_string(),
            ));
        }

        if SHELL_INJECTION_PATTERNS.iter().any(|re| re.is_match(url)) {
            return Err(DownloadError::InvalidUrl(
                "URL contains potentially dangerous patterns".to_string(),
            ));
        }

        Ok(url.to_string())
    }
}

/// Make a playlist title usable as a directory name
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .take(MAX_FILENAME_LEN)
        .collect();

    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "playlist".to_string()
    } else {
        trimmed.to_string()
    }
}
