use crate::fetch::FetchError;
use crate::media::MediaFamily;
use crate::resolver::{ResolutionError, SCAN_LIMIT};
use mecha_exec::ExecError;
use mecha_storage::StoreError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("expected {family}, got content type {found}")]
    UnsupportedMedia { family: MediaFamily, found: String },

    #[error("expected {family}, got encoding {found}")]
    UnsupportedEncoding { family: MediaFamily, found: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("{tool} exited with code {exit_code}")]
    ToolFailed {
        tool: String,
        exit_code: i32,
        stderr_log: Option<PathBuf>,
    },

    #[error("image transform failed: {0}")]
    Transform(String),
}

/// Title and description shown to the user for a failure.
pub struct Notice {
    pub title: String,
    pub description: String,
}

impl Notice {
    fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

impl PipelineError {
    pub fn notice(&self, family: MediaFamily) -> Notice {
        let noun = family.noun();
        match self {
            PipelineError::Resolution(ResolutionError::NoSourceInChannel { .. }) => Notice::new(
                format!("No {} found", noun),
                format!(
                    "No {noun} found in the last {SCAN_LIMIT} messages.\nPlease provide a URL or upload a {noun} to the channel."
                ),
            ),
            PipelineError::Resolution(ResolutionError::NoMatchingAttachment { .. }) => Notice::new(
                format!("No {} found", noun),
                format!("The message does not contain a {noun}.\nPlease provide a URL to a {noun}."),
            ),
            PipelineError::Resolution(ResolutionError::ChannelNotFound(_)) => {
                Notice::new("Text channel not found", "Text channel not found.")
            }
            PipelineError::Resolution(ResolutionError::MessageNotFound(_)) => {
                Notice::new("Message not found", "Message not found")
            }
            PipelineError::Resolution(ResolutionError::InvalidUrl(_)) => Notice::new(
                "Invalid URL",
                format!("The URL provided could not be read.\nPlease provide a URL to a {noun}."),
            ),
            PipelineError::UnsupportedUrl(_) => Notice::new(
                "Unsupported URL",
                format!("YouTube URLs are not supported at this time.\nPlease provide a URL to a {noun}."),
            ),
            PipelineError::UnsupportedMedia { .. } => Notice::new(
                "Unsupported URL",
                format!("The URL provided does not point to a {noun}.\nPlease provide a URL to a {noun}."),
            ),
            PipelineError::UnsupportedEncoding { .. } => Notice::new(
                "Unsupported encoding",
                format!(
                    "The {noun} provided is not in a supported encoding.\nPlease provide a URL to a valid {noun}."
                ),
            ),
            PipelineError::Fetch(_) => Notice::new(
                "Download failed",
                format!("The {noun} could not be downloaded.\nPlease check the URL and try again."),
            ),
            PipelineError::ToolFailed { .. } => Notice::new(
                "FFmpeg error",
                "An error occurred while running FFmpeg.\nPlease try again later.",
            ),
            PipelineError::Transform(_) => Notice::new(
                "Failed to transform image",
                "The image could not be transformed.\nPlease try again later.",
            ),
            PipelineError::Resolution(ResolutionError::Lookup(_))
            | PipelineError::Store(_)
            | PipelineError::Exec(_) => Notice::new(
                "Error",
                "An error occurred while running this command.\nPlease try again later.",
            ),
        }
    }
}
