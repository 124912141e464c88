//! Media command strategies. Each command states what it accepts and how it
//! turns a cached input into an output; the pipeline does the rest.

mod filter;
mod togif;

pub use filter::{Grayscale, PixelFilterCommand, PixelTransform, RainbowOverlay};
pub use togif::ToGif;

use crate::error::PipelineError;
use crate::media::MediaFamily;
use crate::reply::ProgressiveReply;
use mecha_exec::{ToolLogs, Transcoder};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Slash command with an optional `url` option.
    Slash,
    /// Message context-menu command.
    MessageContext,
}

/// Everything a command needs to produce its output.
pub struct TransformContext<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    /// Probed encoding of the input, set for still images.
    pub encoding: Option<&'a str>,
    pub transcoder: &'a Transcoder,
    pub tool_log_dir: &'a Path,
    pub reply: &'a ProgressiveReply,
}

impl TransformContext<'_> {
    /// Opens fresh log files for one tool run.
    pub async fn tool_logs(&self, tool: &str) -> Result<ToolLogs, PipelineError> {
        let logs = ToolLogs::open(self.tool_log_dir, tool).await?;
        debug!(
            "Writing {} output to {} and errors to {}",
            tool,
            logs.stdout_path.display(),
            logs.stderr_path.display()
        );
        Ok(logs)
    }
}

#[async_trait::async_trait]
pub trait MediaCommand: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn kind(&self) -> CommandKind;

    fn family(&self) -> MediaFamily;

    /// Prefix for output cache keys; commands sharing a scope share outputs.
    fn cache_scope(&self) -> &str;

    /// Extension appended to the output artifact, if any.
    fn output_extension(&self) -> Option<&str> {
        None
    }

    /// Attachment name for an uploaded result.
    fn output_filename(&self, encoding: Option<&str>) -> String;

    /// Lead text of the description when the output is too large to upload.
    fn oversize_notice(&self) -> &str;

    /// Writes `ctx.output`. Called only when the output is not cached.
    async fn produce_output(&self, ctx: &TransformContext<'_>) -> Result<(), PipelineError>;
}

/// The commands the bot ships with.
pub fn builtin() -> Vec<Arc<dyn MediaCommand>> {
    vec![
        Arc::new(ToGif::slash()),
        Arc::new(ToGif::message_context()),
        Arc::new(PixelFilterCommand::new(
            "grayscale",
            "Converts an image to grayscale",
            Grayscale,
        )),
        Arc::new(PixelFilterCommand::new(
            "gay",
            "Overlays a rainbow over an image",
            RainbowOverlay,
        )),
    ]
}
