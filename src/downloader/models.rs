// Common data models for downloader

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::errors::{DownloadError, Result};

/// How a URL carrying a playlist identifier should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistMode {
    /// Download only the referenced video
    #[default]
    Single,
    /// Download the whole playlist. Mixes are still forced to a single item.
    Playlist,
    /// Deliberate mix/radio download, capped and tolerant of broken entries
    IntentionalMix,
}

/// One user request. Immutable for the duration of an orchestration call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    /// Quality selector: "best", "1080p", "native", "mp3", ...
    pub quality: String,
    pub audio_only: bool,
    pub output_dir: PathBuf,
    /// Total attempts the retry loop may make (0 behaves like 1)
    pub max_retries: u32,
    #[serde(default)]
    pub playlist_mode: PlaylistMode,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            quality: "best".to_string(),
            audio_only: false,
            output_dir: output_dir.into(),
            max_retries: 3,
            playlist_mode: PlaylistMode::Single,
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn audio_only(mut self, audio_only: bool) -> Self {
        self.audio_only = audio_only;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_playlist_mode(mut self, mode: PlaylistMode) -> Self {
        self.playlist_mode = mode;
        self
    }
}

/// Progress event relayed to the caller's sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Downloading {
        percentage: f64,
        speed: Option<String>,
        eta: Option<String>,
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
    },
    Complete {
        filename: String,
    },
    Error {
        message: String,
    },
    /// A playlist item is about to be downloaded (1-based index)
    #[serde(rename_all = "camelCase")]
    PlaylistItemStart {
        index: usize,
        total: usize,
        title: String,
        playlist_title: String,
    },
    /// A playlist item reached a terminal status
    #[serde(rename_all = "camelCase")]
    PlaylistItemComplete {
        index: usize,
        total: usize,
        item_status: ItemStatus,
        completed: usize,
        failed: usize,
    },
}

/// Per-item status inside a playlist batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Downloading,
    Complete,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }

    /// Forward-only transitions. Nothing re-enters `Pending`.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading) | (Pending, Skipped) | (Downloading, Complete)
                | (Downloading, Failed)
                | (Downloading, Skipped)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    /// 1-based position in the playlist
    pub index: usize,
    pub video_id: String,
    pub title: String,
    pub url: String,
    pub duration: Option<f64>,
    #[serde(default)]
    pub status: ItemStatus,
    /// Failure cause when the item ended `Failed`
    #[serde(default)]
    pub error_message: Option<String>,
    /// Where the downloaded file landed
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl PlaylistItem {
    pub fn new(index: usize, video_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            index,
            video_id: video_id.into(),
            title: title.into(),
            url: url.into(),
            duration: None,
            status: ItemStatus::Pending,
            error_message: None,
            output_path: None,
        }
    }
}

/// Flat playlist listing plus per-item progress.
///
/// Completed/failed counts are derived from item statuses, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistInfo {
    pub playlist_id: String,
    pub title: String,
    pub uploader: String,
    pub url: String,
    pub items: Vec<PlaylistItem>,
    /// 0-based position of the item currently being processed
    #[serde(default)]
    pub current_index: usize,
}

impl PlaylistInfo {
    pub fn total_count(&self) -> usize {
        self.items.len()
    }

    pub fn completed_count(&self) -> usize {
        self.count(ItemStatus::Complete)
    }

    pub fn failed_count(&self) -> usize {
        self.count(ItemStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(ItemStatus::Skipped)
    }

    pub fn pending_count(&self) -> usize {
        self.count(ItemStatus::Pending)
    }

    fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    /// Move item at `position` (0-based) to `next`, rejecting back-transitions
    pub fn transition(&mut self, position: usize, next: ItemStatus) -> Result<()> {
        let item = self.items.get_mut(position).ok_or_else(|| {
            DownloadError::ParseError(format!("No playlist item at position {}", position))
        })?;

        if !item.status.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition {
                index: item.index,
                from: item.status,
                to: next,
            });
        }

        item.status = next;
        Ok(())
    }
}

/// Aggregate result of a playlist batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub output_dir: PathBuf,
}

impl BatchResult {
    pub fn from_playlist(playlist: &PlaylistInfo, output_dir: PathBuf) -> Self {
        Self {
            completed: playlist.completed_count(),
            failed: playlist.failed_count(),
            skipped: playlist.skipped_count(),
            total: playlist.total_count(),
            output_dir,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.completed == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(n: usize) -> PlaylistInfo {
        PlaylistInfo {
            playlist_id: "PL1".to_string(),
            title: "Test".to_string(),
            uploader: "Someone".to_string(),
            url: "https://www.youtube.com/playlist?list=PL1".to_string(),
            items: (1..=n)
                .map(|i| PlaylistItem::new(i, format!("id{i}"), format!("Video {i}"), format!("https://youtu.be/id{i}")))
                .collect(),
            current_index: 0,
        }
    }

    #[test]
    fn test_request_defaults() {
        let req = DownloadRequest::new("https://example.test/watch?v=abc", "/tmp");
        assert_eq!(req.quality, "best");
        assert!(!req.audio_only);
        assert_eq!(req.max_retries, 3);
        assert_eq!(req.playlist_mode, PlaylistMode::Single);
    }

    #[test]
    fn test_forward_only_transitions() {
        use ItemStatus::*;
        assert!(Pending.can_transition_to(Downloading));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Downloading.can_transition_to(Complete));
        assert!(Downloading.can_transition_to(Failed));
        assert!(Downloading.can_transition_to(Skipped));

        assert!(!Downloading.can_transition_to(Pending));
        assert!(!Complete.can_transition_to(Downloading));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Skipped.can_transition_to(Downloading));
        assert!(!Pending.can_transition_to(Complete));
    }

    #[test]
    fn test_counts_are_derived() {
        let mut p = playlist(4);
        p.transition(0, ItemStatus::Downloading).unwrap();
        p.transition(0, ItemStatus::Complete).unwrap();
        p.transition(1, ItemStatus::Downloading).unwrap();
        p.transition(1, ItemStatus::Failed).unwrap();
        p.transition(2, ItemStatus::Skipped).unwrap();

        assert_eq!(p.completed_count(), 1);
        assert_eq!(p.failed_count(), 1);
        assert_eq!(p.skipped_count(), 1);
        assert_eq!(p.pending_count(), 1);
        assert_eq!(p.total_count(), 4);
    }

    #[test]
    fn test_back_transition_rejected() {
        let mut p = playlist(1);
        p.transition(0, ItemStatus::Downloading).unwrap();
        p.transition(0, ItemStatus::Complete).unwrap();

        let err = p.transition(0, ItemStatus::Pending).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::InvalidTransition { index: 1, from: ItemStatus::Complete, to: ItemStatus::Pending }
        ));
        assert_eq!(p.items[0].status, ItemStatus::Complete);
    }

    #[test]
    fn test_progress_event_shape() {
        let ev = ProgressEvent::Downloading {
            percentage: 42.5,
            speed: Some("1.2MiB/s".to_string()),
            eta: Some("00:10".to_string()),
            downloaded_bytes: Some(100),
            total_bytes: Some(200),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["percentage"], 42.5);
        assert_eq!(json["downloadedBytes"], 100);
        assert_eq!(json["totalBytes"], 200);

        let done = serde_json::to_value(ProgressEvent::Complete { filename: "a.mp4".into() }).unwrap();
        assert_eq!(done["status"], "complete");
        assert_eq!(done["filename"], "a.mp4");

        let item = serde_json::to_value(ProgressEvent::PlaylistItemComplete {
            index: 2,
            total: 5,
            item_status: ItemStatus::Failed,
            completed: 1,
            failed: 1,
        })
        .unwrap();
        assert_eq!(item["status"], "playlist_item_complete");
        assert_eq!(item["itemStatus"], serde_json::to_value(ItemStatus::Failed).unwrap());
        assert!(item.get("item_status").is_none());
    }

    #[test]
    fn test_batch_result_success() {
        let mut p = playlist(2);
        for i in 0..2 {
            p.transition(i, ItemStatus::Downloading).unwrap();
            p.transition(i, ItemStatus::Complete).unwrap();
        }
        let result = BatchResult::from_playlist(&p, PathBuf::from("/tmp/Test"));
        assert!(result.is_success());
        assert_eq!(result.total, 2);
    }
}
