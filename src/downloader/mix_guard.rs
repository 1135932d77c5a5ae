// Mix-playlist guard
//
// Mix/radio playlists are generated on the fly and never end. A URL that
// carries one is forced to single-item download unless the caller asks
// for an intentional mix download, which is capped and skips broken
// entries instead of aborting.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use super::models::PlaylistMode;

lazy_static! {
    static ref PLAYLIST_PATTERNS: Vec<Regex> = [
        r"youtube\.com/playlist\?list=",
        r"youtube\.com/watch\?.*&list=",
        r"youtu\.be/.*\?list=",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixGuardConfig {
    /// Playlist-id prefixes of dynamically generated playlists
    pub prefixes: Vec<String>,
    /// Item cap for intentional mix downloads
    pub max_items: usize,
    /// Query parameter holding the playlist id
    pub list_param: String,
}

impl Default for MixGuardConfig {
    fn default() -> Self {
        Self {
            prefixes: ["RD", "RDAMVM", "RDCMUC", "RDEM", "RDMM", "RDQM", "RDVM"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_items: 25,
            list_param: "list".to_string(),
        }
    }
}

/// How much of a playlist the engine may fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistPolicy {
    /// Only the referenced item
    SingleItem,
    /// At most `max_items`, optionally skipping broken entries
    Capped { max_items: usize, ignore_errors: bool },
    /// The whole playlist
    Full,
}

#[derive(Debug, Clone, Default)]
pub struct MixPlaylistGuard {
    config: MixGuardConfig,
}

impl MixPlaylistGuard {
    pub fn new(config: MixGuardConfig) -> Self {
        Self { config }
    }

    pub fn max_items(&self) -> usize {
        self.config.max_items
    }

    /// Playlist identifier from the URL's query string, if any
    pub fn playlist_id(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url.trim()).ok()?;
        parsed
            .query_pairs()
            .find(|(k, _)| k == self.config.list_param.as_str())
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    }

    /// Whether the URL references a dynamically generated mix
    pub fn is_mix(&self, url: &str) -> bool {
        match self.playlist_id(url) {
            Some(id) => self.is_mix_id(&id),
            None => false,
        }
    }

    pub fn is_mix_id(&self, playlist_id: &str) -> bool {
        self.config.prefixes.iter().any(|p| playlist_id.starts_with(p.as_str()))
    }

    /// Whether the URL points at a playlist at all
    pub fn is_playlist_url(&self, url: &str) -> bool {
        PLAYLIST_PATTERNS.iter().any(|re| re.is_match(url))
    }

    /// Policy handed to the engine for this URL and requested mode
    pub fn policy_for(&self, url: &str, mode: PlaylistMode) -> PlaylistPolicy {
        let is_mix = self.is_mix(url);

        match mode {
            PlaylistMode::Single => PlaylistPolicy::SingleItem,
            PlaylistMode::Playlist if is_mix => {
                info!(
                    "[MixGuard] Detected Mix playlist - downloading single video only. \
                     Use mix mode to download up to {} tracks.",
                    self.config.max_items
                );
                PlaylistPolicy::SingleItem
            }
            PlaylistMode::Playlist => PlaylistPolicy::Full,
            PlaylistMode::IntentionalMix => PlaylistPolicy::Capped {
                max_items: self.config.max_items,
                ignore_errors: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_prefixes() {
        let guard = MixPlaylistGuard::default();
        assert!(guard.is_mix("https://www.youtube.com/watch?v=abc&list=RDabc123"));
        assert!(guard.is_mix("https://www.youtube.com/watch?v=abc&list=RDEMxyz"));
        assert!(guard.is_mix("https://www.youtube.com/watch?list=RDCMUCabc&v=abc"));
        assert!(!guard.is_mix("https://www.youtube.com/playlist?list=PL1C05C342371235C6"));
        assert!(!guard.is_mix("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn test_unparseable_url_is_not_mix() {
        let guard = MixPlaylistGuard::default();
        assert!(!guard.is_mix("not a url"));
        assert!(!guard.is_mix("https://www.youtube.com/watch?v=abc&list="));
    }

    #[test]
    fn test_playlist_url_detection() {
        let guard = MixPlaylistGuard::default();
        assert!(guard.is_playlist_url("https://www.youtube.com/playlist?list=PL123"));
        assert!(guard.is_playlist_url("https://www.youtube.com/watch?v=abc&list=PL123"));
        assert!(guard.is_playlist_url("https://youtu.be/abc?list=PL123"));
        assert!(!guard.is_playlist_url("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn test_mix_forced_to_single_in_playlist_mode() {
        let guard = MixPlaylistGuard::default();
        let mix = "https://www.youtube.com/watch?v=abc&list=RDabc";
        assert_eq!(guard.policy_for(mix, PlaylistMode::Playlist), PlaylistPolicy::SingleItem);
        assert_eq!(guard.policy_for(mix, PlaylistMode::Single), PlaylistPolicy::SingleItem);
        assert_eq!(
            guard.policy_for(mix, PlaylistMode::IntentionalMix),
            PlaylistPolicy::Capped { max_items: 25, ignore_errors: true }
        );
    }

    #[test]
    fn test_regular_playlist_downloads_fully() {
        let guard = MixPlaylistGuard::default();
        let url = "https://www.youtube.com/playlist?list=PL1C05C342371235C6";
        assert_eq!(guard.policy_for(url, PlaylistMode::Playlist), PlaylistPolicy::Full);
    }

    #[test]
    fn test_injected_prefixes_and_cap() {
        let guard = MixPlaylistGuard::new(MixGuardConfig {
            prefixes: vec!["XX".to_string()],
            max_items: 5,
            list_param: "list".to_string(),
        });
        assert!(guard.is_mix("https://example.test/watch?list=XX1"));
        assert!(!guard.is_mix("https://example.test/watch?list=RD1"));
        assert_eq!(
            guard.policy_for("https://example.test/watch?list=XX1", PlaylistMode::IntentionalMix),
            PlaylistPolicy::Capped { max_items: 5, ignore_errors: true }
        );
    }
}
