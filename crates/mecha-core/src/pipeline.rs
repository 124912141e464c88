//! Command pipeline: resolve, fetch on miss, transform on miss, reply.

use crate::commands::{MediaCommand, TransformContext};
use crate::error::PipelineError;
use crate::fetch::{FetchError, HttpFetcher};
use crate::media::MediaFamily;
use crate::platform::{ChannelLookup, Invocation, ReplySink};
use crate::reply::{render_reply, ProgressiveReply, Renderer, ReplyKey, ReplyState, ReplyStatus};
use crate::resolver::{ResolutionError, SourceResolver};
use mecha_config::{MediaSettings, RuntimeMode};
use mecha_exec::{tail, ProcessRunner, Transcoder};
use mecha_storage::{ContentStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

const STDERR_EXCERPT_CHARS: usize = 1500;

const YOUTUBE_HOSTS: [&str; 4] = ["youtube.com", "www.youtube.com", "m.youtube.com", "youtu.be"];

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mode: RuntimeMode,
    pub exported_file_url: String,
    pub upload_limit_bytes: u64,
    pub reply_interval: Duration,
    pub tool_log_dir: PathBuf,
}

impl PipelineSettings {
    pub fn from_media(media: &MediaSettings, mode: RuntimeMode) -> Self {
        Self {
            mode,
            exported_file_url: media.exported_file_url.clone(),
            upload_limit_bytes: media.upload_limit_bytes,
            reply_interval: Duration::from_millis(media.reply_interval_ms),
            tool_log_dir: media.tool_log_dir.clone(),
        }
    }
}

struct Finished {
    output: PathBuf,
    encoding: Option<String>,
}

pub struct Pipeline {
    store: Arc<ContentStore>,
    fetcher: HttpFetcher,
    transcoder: Transcoder,
    lookup: Arc<dyn ChannelLookup>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<ContentStore>,
        fetcher: HttpFetcher,
        transcoder: Transcoder,
        lookup: Arc<dyn ChannelLookup>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            transcoder,
            lookup,
            settings,
        }
    }

    /// Wires a pipeline from validated media settings.
    pub fn from_media(
        media: &MediaSettings,
        mode: RuntimeMode,
        lookup: Arc<dyn ChannelLookup>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self, FetchError> {
        Ok(Self::new(
            Arc::new(ContentStore::new(
                &media.cached_file_dir,
                &media.exported_file_dir,
            )),
            HttpFetcher::new()?,
            Transcoder::new(runner, &media.ffmpeg_path, &media.ffprobe_path),
            lookup,
            PipelineSettings::from_media(media, mode),
        ))
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Runs one invocation to completion. Every outcome, including failure,
    /// ends with the reply closed; the final state is returned.
    pub async fn execute(
        &self,
        command: &dyn MediaCommand,
        invocation: &Invocation,
        sink: Arc<dyn ReplySink>,
    ) -> ReplyState {
        let family = command.family();
        let mut reply = ProgressiveReply::new(
            sink,
            self.renderer(command),
            self.settings.reply_interval,
        );
        reply.set_status(ReplyStatus::Processing);
        reply.set_data(ReplyKey::Title, format!("Fetching {} URL", family));
        reply.set_data(ReplyKey::Description, "");

        if let Err(e) = reply.init().await {
            warn!("Failed to acknowledge {}: {:#}", command.name(), e);
            return reply.close().await;
        }

        match self.drive(command, invocation, &reply).await {
            Ok(finished) => self.report_success(command, &reply, finished).await,
            Err(err) => self.report_failure(command, invocation, &reply, &err).await,
        }
        reply.close().await
    }

    fn renderer(&self, command: &dyn MediaCommand) -> Renderer {
        let mode = self.settings.mode;
        let fallback = command.output_filename(None);
        Arc::new(move |state: &ReplyState| render_reply(state, mode, &fallback))
    }

    async fn drive(
        &self,
        command: &dyn MediaCommand,
        invocation: &Invocation,
        reply: &ProgressiveReply,
    ) -> Result<Finished, PipelineError> {
        let family = command.family();
        self.store.ensure_dirs().await?;

        let source = SourceResolver::new(self.lookup.as_ref(), family)
            .resolve(invocation, reply)
            .await?;
        let url = source.url;

        reply.set_data(ReplyKey::Title, format!("Downloading {}...", family));
        reply.set_data(ReplyKey::Description, "");
        reply.add_data_line(ReplyKey::Log, format!("URL: {}", url));
        reply.update(false).await;

        if is_youtube(&url) {
            reply.add_data_line(ReplyKey::Log, "YouTube URL detected");
            return Err(PipelineError::UnsupportedUrl(url));
        }

        let input_key = ContentStore::input_key(&url);
        let input = self.store.input_path(&input_key);
        if self.store.exists(&input).await {
            reply.add_data_line(ReplyKey::Log, format!("Using cached file {}", input_key));
            reply.update(false).await;
        } else {
            reply.add_data_line(
                ReplyKey::Log,
                format!("Cache miss, downloading file {}", input_key),
            );
            self.download(&url, &input, family, reply).await?;
        }

        let encoding = match family {
            MediaFamily::StillImage => {
                let encoding = self.transcoder.detect_encoding(&input).await?;
                if !family.accepts_encoding(&encoding) {
                    reply.add_data_line(ReplyKey::Log, format!("Invalid encoding, got {}", encoding));
                    return Err(PipelineError::UnsupportedEncoding {
                        family,
                        found: encoding,
                    });
                }
                Some(encoding)
            }
            MediaFamily::Video => None,
        };

        let output_key = ContentStore::output_key(command.cache_scope(), &input_key);
        let output = self
            .store
            .output_path(&output_key, command.output_extension());
        if self.store.exists(&output).await {
            reply.add_data_line(
                ReplyKey::Log,
                format!("Using cached file {}", basename(&output)),
            );
            reply.update(false).await;
        } else {
            let ctx = TransformContext {
                input: &input,
                output: &output,
                encoding: encoding.as_deref(),
                transcoder: &self.transcoder,
                tool_log_dir: &self.settings.tool_log_dir,
                reply,
            };
            command.produce_output(&ctx).await?;
        }

        Ok(Finished { output, encoding })
    }

    async fn download(
        &self,
        url: &str,
        input: &Path,
        family: MediaFamily,
        reply: &ProgressiveReply,
    ) -> Result<(), PipelineError> {
        let resource = self.fetcher.fetch(url).await?;
        let content_type = resource.content_type.clone().unwrap_or_default();
        if !family.accepts_mime(&content_type) {
            resource.discard();
            reply.add_data_line(
                ReplyKey::Log,
                format!("Expected mime type {}/*, got {}", family, content_type),
            );
            return Err(PipelineError::UnsupportedMedia {
                family,
                found: content_type,
            });
        }

        reply.add_data_line(ReplyKey::Log, "Downloading file...");
        reply.update(false).await;
        let written = self
            .store
            .persist(input, resource.into_stream())
            .await
            .map_err(|e| persist_error(url, e))?;
        debug!("Downloaded {} bytes from {}", written, url);
        reply.add_data_line(ReplyKey::Log, "File downloaded");
        reply.update(false).await;
        Ok(())
    }

    async fn report_success(
        &self,
        command: &dyn MediaCommand,
        reply: &ProgressiveReply,
        finished: Finished,
    ) {
        let size = self.store.size_of(&finished.output).await;
        reply.set_status(ReplyStatus::Success);
        reply.set_data(ReplyKey::Title, "Conversion complete");

        if size > self.settings.upload_limit_bytes {
            info!(
                "{} output {} is {} bytes, sharing link",
                command.name(),
                finished.output.display(),
                size
            );
            reply.set_data(
                ReplyKey::Description,
                format!(
                    "{}\n{}{}",
                    command.oversize_notice(),
                    self.settings.exported_file_url,
                    basename(&finished.output)
                ),
            );
            reply.set_data(ReplyKey::Log, "");
        } else {
            reply.set_data(ReplyKey::Uploadable, "true");
            reply.set_data(ReplyKey::Path, finished.output.to_string_lossy());
            reply.set_data(
                ReplyKey::OutputFilename,
                command.output_filename(finished.encoding.as_deref()),
            );
        }
    }

    async fn report_failure(
        &self,
        command: &dyn MediaCommand,
        invocation: &Invocation,
        reply: &ProgressiveReply,
        err: &PipelineError,
    ) {
        match err {
            PipelineError::Resolution(ResolutionError::Lookup(_))
            | PipelineError::Store(_)
            | PipelineError::Exec(_)
            | PipelineError::Transform(_)
            | PipelineError::ToolFailed { .. } => error!(
                "{} failed for user {} in channel {}: {}",
                command.name(),
                invocation.user_id,
                invocation.channel_id,
                err
            ),
            _ => info!("{} rejected: {}", command.name(), err),
        }

        let notice = err.notice(command.family());
        reply.set_status(ReplyStatus::Error);
        reply.set_data(ReplyKey::Title, notice.title);
        reply.set_data(ReplyKey::Description, notice.description);

        if !self.settings.mode.is_dev() {
            return;
        }
        if let PipelineError::ToolFailed {
            stderr_log: Some(path),
            ..
        } = err
        {
            let excerpt = tail(path, STDERR_EXCERPT_CHARS).await;
            let excerpt = excerpt.trim();
            if !excerpt.is_empty() {
                reply.add_data_line(ReplyKey::Log, format!("stderr:\n{}", excerpt));
            }
        }
    }
}

/// A body that breaks off mid-transfer is a download failure, not a storage one.
fn persist_error(url: &str, err: StoreError) -> PipelineError {
    match err {
        StoreError::Stream(source) => PipelineError::Fetch(FetchError::Interrupted {
            url: url.to_string(),
            source,
        }),
        other => PipelineError::Store(other),
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// YouTube pages are HTML, never direct media.
pub fn is_youtube(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .map_or(false, |host| YOUTUBE_HOSTS.contains(&host.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_urls_are_detected() {
        assert!(is_youtube("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_youtube("https://youtu.be/dQw4w9WgXcQ"));
        assert!(!is_youtube("https://cdn.example.com/youtube.mp4"));
        assert!(!is_youtube("not a url"));
    }

    #[test]
    fn interrupted_body_is_reported_as_failed_download() {
        let broken = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = persist_error("https://cdn.example.com/a.mp4", StoreError::Stream(Box::new(broken)));
        assert!(matches!(
            &err,
            PipelineError::Fetch(FetchError::Interrupted { url, .. }) if url == "https://cdn.example.com/a.mp4"
        ));
        assert_eq!(err.notice(MediaFamily::Video).title, "Download failed");

        let disk = StoreError::Write {
            path: PathBuf::from("/cache/abc"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let err = persist_error("https://cdn.example.com/a.mp4", disk);
        assert!(matches!(err, PipelineError::Store(_)));
        assert_eq!(err.notice(MediaFamily::Video).title, "Error");
    }

    #[test]
    fn basename_of_export_path() {
        assert_eq!(basename(Path::new("/export/abc.gif")), "abc.gif");
    }
}
