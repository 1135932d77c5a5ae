// Playlist batch orchestrator
//
// Downloads playlist items one after another into a playlist-named
// sub-directory. Serial on purpose: items share the output directory and
// parallel requests trip rate limits.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::errors::Result;
use super::mix_guard::PlaylistPolicy;
use super::models::{BatchResult, DownloadRequest, ItemStatus, PlaylistInfo, PlaylistMode, ProgressEvent};
use super::orchestrator::{CancelFlag, DownloadContext, DownloadOrchestrator, RetryState};
use super::traits::{EngineInvocation, ProgressSink, SinkControl};
use super::validators::sanitize_filename;

pub struct PlaylistBatchOrchestrator {
    orchestrator: DownloadOrchestrator,
    max_retries: u32,
}

impl PlaylistBatchOrchestrator {
    pub fn new(ctx: Arc<DownloadContext>) -> Self {
        Self::with_cancel_flag(ctx, CancelFlag::new())
    }

    /// Share a cancel flag with the caller; setting it skips every remaining item
    pub fn with_cancel_flag(ctx: Arc<DownloadContext>, cancel: CancelFlag) -> Self {
        let max_retries = ctx.config.retry.max_retries;
        Self {
            orchestrator: DownloadOrchestrator::with_cancel_flag(ctx, cancel),
            max_retries,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.orchestrator.cancel_flag()
    }

    /// Flat listing of a playlist URL. `None` if the engine finds no playlist,
    /// or if the mode resolves to a single item (mixes outside
    /// `IntentionalMix`), in which case the engine is not asked at all.
    pub async fn extract(&self, url: &str, mode: PlaylistMode) -> Result<Option<PlaylistInfo>> {
        let ctx = self.orchestrator.context();
        let policy = ctx.mix_guard.policy_for(url, mode);
        if policy == PlaylistPolicy::SingleItem {
            info!("[Playlist] {:?} resolves to a single item, not listing: {}", mode, url);
            return Ok(None);
        }
        let creds = ctx.negotiate_credentials().await?;

        let invocation = EngineInvocation {
            url: url.to_string(),
            format: ctx.resolver.resolve("best", false),
            output_dir: std::env::temp_dir(),
            credentials: creds.source,
            user_agent: creds.user_agent,
            playlist: policy,
            runtimes: ctx.runtimes.clone(),
            network: ctx.config.network.clone(),
            engine: ctx.config.engine.clone(),
        };

        info!("[Playlist] Extracting playlist info: {}", url);
        let playlist = ctx.engine.extract_playlist(&invocation).await?;
        if let Some(p) = &playlist {
            info!("[Playlist] Found {} items in '{}'", p.total_count(), p.title);
        }
        Ok(playlist)
    }

    fn skip_remaining(playlist: &mut PlaylistInfo, from: usize) -> Result<()> {
        for pos in from..playlist.items.len() {
            if playlist.items[pos].status == ItemStatus::Pending {
                playlist.transition(pos, ItemStatus::Skipped)?;
            }
        }
        Ok(())
    }

    /// Mix listings never download past the guard's cap
    fn cap_mix(&self, playlist: &mut PlaylistInfo) -> Result<()> {
        let guard = &self.orchestrator.context().mix_guard;
        if !guard.is_mix_id(&playlist.playlist_id) && !guard.is_mix(&playlist.url) {
            return Ok(());
        }
        let cap = guard.max_items();
        if playlist.items.len() > cap {
            warn!(
                "[Playlist] Mix '{}' lists {} items, keeping the first {}",
                playlist.title,
                playlist.items.len(),
                cap
            );
            Self::skip_remaining(playlist, cap)?;
        }
        Ok(())
    }

    /// Download every pending item of `playlist` into
    /// `output_dir/<sanitized playlist title>`. A cancellation ends this
    /// batch only; the flag is cleared before returning.
    pub async fn run(
        &mut self,
        playlist: &mut PlaylistInfo,
        output_dir: &Path,
        quality: &str,
        audio_only: bool,
        sink: &dyn ProgressSink,
    ) -> Result<BatchResult> {
        let playlist_dir = output_dir.join(sanitize_filename(&playlist.title));
        tokio::fs::create_dir_all(&playlist_dir).await?;
        self.cap_mix(playlist)?;

        let total = playlist.total_count();
        let cancel = self.orchestrator.cancel_flag();
        info!(
            "[Playlist] Starting batch '{}' ({} items) -> {}",
            playlist.title,
            total,
            playlist_dir.display()
        );

        for pos in 0..total {
            if playlist.items[pos].status != ItemStatus::Pending {
                continue;
            }

            if cancel.is_cancelled() || sink.poll() == SinkControl::Cancel {
                cancel.cancel();
                info!("[Playlist] Cancelled, skipping {} remaining item(s)", total - pos);
                Self::skip_remaining(playlist, pos)?;
                break;
            }

            playlist.current_index = pos;
            playlist.transition(pos, ItemStatus::Downloading)?;

            let item = &playlist.items[pos];
            let index = item.index;
            info!("[Playlist] [{}/{}] {}", index, total, item.title);
            sink.emit(ProgressEvent::PlaylistItemStart {
                index,
                total,
                title: item.title.clone(),
                playlist_title: playlist.title.clone(),
            });

            let request = DownloadRequest::new(item.url.clone(), playlist_dir.clone())
                .with_quality(quality)
                .audio_only(audio_only)
                .with_max_retries(self.max_retries);

            let mut stop = false;
            let status = match self.orchestrator.run(&request, sink).await {
                Ok(report) => {
                    let item = &mut playlist.items[pos];
                    item.output_path = report.filename.map(|f| playlist_dir.join(f));
                    item.error_message = report.error.map(|e| e.to_string());
                    match report.state {
                        RetryState::Success => ItemStatus::Complete,
                        RetryState::Cancelled => {
                            stop = true;
                            ItemStatus::Skipped
                        }
                        _ => ItemStatus::Failed,
                    }
                }
                Err(e) => {
                    warn!("[Playlist] Item {} could not start: {}", index, e);
                    playlist.items[pos].error_message = Some(e.to_string());
                    ItemStatus::Failed
                }
            };
            playlist.transition(pos, status)?;

            sink.emit(ProgressEvent::PlaylistItemComplete {
                index,
                total,
                item_status: status,
                completed: playlist.completed_count(),
                failed: playlist.failed_count(),
            });

            if stop {
                info!("[Playlist] Cancelled during item {}, skipping the rest", index);
                Self::skip_remaining(playlist, pos + 1)?;
                break;
            }
        }
        cancel.reset();

        let result = BatchResult::from_playlist(playlist, playlist_dir);
        info!(
            "[Playlist] Batch done: {} completed, {} failed, {} skipped of {}",
            result.completed, result.failed, result.skipped, result.total
        );
        Ok(result)
    }
}
