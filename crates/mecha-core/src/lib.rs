//! Mechafoord Core
//!
//! Media command pipeline: source resolution, content-addressed caching,
//! external tool invocation and the progressive reply.

pub mod commands;
pub mod error;
pub mod fetch;
pub mod media;
pub mod pipeline;
pub mod platform;
pub mod reply;
pub mod resolver;

pub use commands::{builtin, CommandKind, MediaCommand};
pub use error::PipelineError;
pub use fetch::{FetchError, HttpFetcher};
pub use media::MediaFamily;
pub use pipeline::{Pipeline, PipelineSettings};
pub use platform::{
    AttachmentRef, CardColor, ChannelLookup, ChannelRef, Invocation, InvocationInput, MessageRef,
    ReplyPayload, ReplySink,
};
pub use reply::{ProgressiveReply, ReplyKey, ReplyState, ReplyStatus};
pub use resolver::{ResolutionError, ResolvedSource, SourceResolver};
