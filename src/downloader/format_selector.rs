// FormatResolver - quality selector to engine format spec
//
// Maps a user-facing selector ("best", "720p", "native", "mp3", "wav", ...)
// to:
// - the engine format expression
// - the post-processing chain (audio extraction, metadata, thumbnail)
// - the container/merge policy
//
// Unknown selectors resolve to "best" instead of failing.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Target bitrate for audio extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioQuality {
    /// kbps
    Bitrate(u32),
    /// Codec-native lossless (engine quality "0")
    Lossless,
}

impl AudioQuality {
    /// Value for the engine's audio quality flag
    pub fn engine_value(&self) -> String {
        match self {
            Self::Bitrate(kbps) => format!("{}K", kbps),
            Self::Lossless => "0".to_string(),
        }
    }
}

/// One post-processing step, applied in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostProcessor {
    ExtractAudio { codec: String, quality: AudioQuality },
    EmbedMetadata,
    EmbedThumbnail,
}

/// What happens to separate video/audio streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerPolicy {
    /// Merge into the given container
    Merge(String),
    /// Leave the engine's own multiplexing choice alone
    Native,
    /// Audio-only output, nothing to merge
    None,
}

/// Resolved format for one request. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatSpec {
    /// Engine format expression (e.g. "bv*[height<=720]+ba/b[height<=720]/bv*+ba/best")
    pub format: String,
    pub postprocessors: Vec<PostProcessor>,
    pub container: ContainerPolicy,
    pub write_thumbnail: bool,
}

impl FormatSpec {
    pub fn is_audio(&self) -> bool {
        self.audio_codec().is_some()
    }

    pub fn audio_codec(&self) -> Option<&str> {
        self.postprocessors.iter().find_map(|p| match p {
            PostProcessor::ExtractAudio { codec, .. } => Some(codec.as_str()),
            _ => None,
        })
    }

    pub fn embeds_thumbnail(&self) -> bool {
        self.postprocessors.contains(&PostProcessor::EmbedThumbnail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoQuality {
    pub name: String,
    /// Resolution ceiling, `None` for unrestricted
    pub max_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPreset {
    pub name: String,
    pub codec: String,
    pub quality: AudioQuality,
}

/// Quality tables consulted by the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityTable {
    pub video: Vec<VideoQuality>,
    pub audio: Vec<AudioPreset>,
    /// Preset used when `audio_only` is set with a non-audio selector
    pub default_audio: String,
    /// Codecs whose containers can carry cover art
    pub thumbnail_codecs: Vec<String>,
    /// Merge container for video downloads
    pub default_container: String,
}

impl Default for QualityTable {
    fn default() -> Self {
        let video = [
            ("best", None),
            ("2160p", Some(2160)),
            ("1440p", Some(1440)),
            ("1080p", Some(1080)),
            ("720p", Some(720)),
            ("480p", Some(480)),
            ("360p", Some(360)),
        ]
        .into_iter()
        .map(|(name, max_height)| VideoQuality {
            name: name.to_string(),
            max_height,
        })
        .collect();

        let audio = [
            ("mp3", "mp3", AudioQuality::Bitrate(320)),
            ("wav", "wav", AudioQuality::Lossless),
            ("flac", "flac", AudioQuality::Lossless),
            ("aac", "aac", AudioQuality::Bitrate(256)),
            ("opus", "opus", AudioQuality::Bitrate(128)),
            ("audio", "mp3", AudioQuality::Bitrate(320)),
        ]
        .into_iter()
        .map(|(name, codec, quality)| AudioPreset {
            name: name.to_string(),
            codec: codec.to_string(),
            quality,
        })
        .collect();

        Self {
            video,
            audio,
            default_audio: "mp3".to_string(),
            thumbnail_codecs: ["mp3", "opus", "flac", "aac", "m4a"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_container: "mp4".to_string(),
        }
    }
}

impl QualityTable {
    fn audio_preset(&self, name: &str) -> Option<&AudioPreset> {
        self.audio.iter().find(|p| p.name == name)
    }

    fn video_quality(&self, name: &str) -> Option<&VideoQuality> {
        self.video.iter().find(|q| q.name == name)
    }

    fn supports_thumbnail(&self, codec: &str) -> bool {
        self.thumbnail_codecs.iter().any(|c| c == codec)
    }
}

pub const NATIVE_QUALITY: &str = "native";
const BEST_EXPRESSION: &str = "bv*+ba/best";
const AUDIO_EXPRESSION: &str = "ba/b";

/// Format resolver with injected quality tables
#[derive(Debug, Clone, Default)]
pub struct FormatResolver {
    table: QualityTable,
}

impl FormatResolver {
    pub fn new(table: QualityTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &QualityTable {
        &self.table
    }

    /// Whether a selector names an audio preset
    pub fn is_audio_selector(&self, quality: &str) -> bool {
        self.table.audio_preset(&quality.trim().to_lowercase()).is_some()
    }

    /// Resolve a quality selector into a format spec. Never fails.
    pub fn resolve(&self, quality: &str, audio_only: bool) -> FormatSpec {
        let quality = quality.trim().to_lowercase();

        if quality == NATIVE_QUALITY && !audio_only {
            return FormatSpec {
                format: BEST_EXPRESSION.to_string(),
                postprocessors: Vec::new(),
                container: ContainerPolicy::Native,
                write_thumbnail: false,
            };
        }

        if audio_only || self.table.audio_preset(&quality).is_some() {
            return self.resolve_audio(&quality);
        }

        self.resolve_video(&quality)
    }

    fn resolve_audio(&self, quality: &str) -> FormatSpec {
        let (codec, bitrate) = match self
            .table
            .audio_preset(quality)
            .or_else(|| self.table.audio_preset(&self.table.default_audio))
        {
            Some(preset) => (preset.codec.clone(), preset.quality),
            None => (self.table.default_audio.clone(), AudioQuality::Bitrate(320)),
        };

        let mut postprocessors = vec![
            PostProcessor::ExtractAudio {
                codec: codec.clone(),
                quality: bitrate,
            },
            PostProcessor::EmbedMetadata,
        ];

        // wav can't carry embedded images
        let thumbnail = self.table.supports_thumbnail(&codec);
        if thumbnail {
            postprocessors.push(PostProcessor::EmbedThumbnail);
        }

        debug!("[FormatResolver] audio {} -> codec {} ({:?})", quality, codec, bitrate);

        FormatSpec {
            format: AUDIO_EXPRESSION.to_string(),
            postprocessors,
            container: ContainerPolicy::None,
            write_thumbnail: thumbnail,
        }
    }

    fn resolve_video(&self, quality: &str) -> FormatSpec {
        let max_height = match self.table.video_quality(quality) {
            Some(q) => q.max_height,
            None => {
                debug!("[FormatResolver] unknown quality '{}', using best", quality);
                None
            }
        };

        FormatSpec {
            format: video_expression(max_height),
            postprocessors: vec![PostProcessor::EmbedMetadata],
            container: ContainerPolicy::Merge(self.table.default_container.clone()),
            write_thumbnail: false,
        }
    }
}

/// Engine format expression for a resolution ceiling
fn video_expression(max_height: Option<u32>) -> String {
    match max_height {
        Some(h) => format!("bv*[height<={h}]+ba/b[height<={h}]/bv*+ba/best"),
        None => BEST_EXPRESSION.to_string(),
    }
}
