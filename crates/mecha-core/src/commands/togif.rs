use super::{CommandKind, MediaCommand, TransformContext};
use crate::error::PipelineError;
use crate::media::MediaFamily;
use crate::reply::ReplyKey;

/// Video to GIF, as a slash command or a message context-menu entry.
pub struct ToGif {
    name: &'static str,
    description: &'static str,
    kind: CommandKind,
}

impl ToGif {
    pub fn slash() -> Self {
        Self {
            name: "togif",
            description: "Converts a video to a GIF",
            kind: CommandKind::Slash,
        }
    }

    pub fn message_context() -> Self {
        Self {
            name: "Convert video to GIF",
            description: "",
            kind: CommandKind::MessageContext,
        }
    }
}

#[async_trait::async_trait]
impl MediaCommand for ToGif {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn kind(&self) -> CommandKind {
        self.kind
    }

    fn family(&self) -> MediaFamily {
        MediaFamily::Video
    }

    fn cache_scope(&self) -> &str {
        "togif"
    }

    fn output_extension(&self) -> Option<&str> {
        Some("gif")
    }

    fn output_filename(&self, _encoding: Option<&str>) -> String {
        "output.gif".to_string()
    }

    fn oversize_notice(&self) -> &str {
        "The video has been converted to a GIF.\nUnfortunately the file is too large, you can download the GIF at:"
    }

    async fn produce_output(&self, ctx: &TransformContext<'_>) -> Result<(), PipelineError> {
        ctx.reply.set_data(ReplyKey::Title, "Converting video to GIF");
        ctx.reply.set_data(ReplyKey::Description, "");
        ctx.reply.add_data_line(ReplyKey::Log, "Converting video to GIF");
        ctx.reply.update(false).await;

        let mut logs = ctx.tool_logs("ffmpeg").await?;
        let stderr_log = logs.stderr_path.clone();
        let (out, err) = logs.sinks();
        let exit_code = ctx
            .transcoder
            .video_to_gif(ctx.input, ctx.output, out, err)
            .await?;

        if exit_code != 0 {
            ctx.reply.add_data_line(
                ReplyKey::Log,
                format!("FFmpeg exited with code {}", exit_code),
            );
            return Err(PipelineError::ToolFailed {
                tool: "ffmpeg".to_string(),
                exit_code,
                stderr_log: Some(stderr_log),
            });
        }
        Ok(())
    }
}
