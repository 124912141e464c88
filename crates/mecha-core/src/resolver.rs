//! Works out which URL an invocation refers to: an explicit URL, the newest
//! matching attachment in the channel, or the attachment behind a message
//! permalink.

use crate::media::MediaFamily;
use crate::platform::{AttachmentRef, ChannelLookup, Invocation, InvocationInput, MessageRef};
use crate::reply::{ProgressiveReply, ReplyKey};
use tracing::debug;
use url::Url;

/// How many recent messages a channel scan looks at.
pub const SCAN_LIMIT: u8 = 100;

const PERMALINK_HOST: &str = "discord.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub url: String,
    /// `(channel id, message id)` when the URL came from a message.
    pub origin: Option<(u64, u64)>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("no {family} found in the last {limit} messages")]
    NoSourceInChannel { family: MediaFamily, limit: u8 },

    #[error("message {message_id} has no {family} attachment")]
    NoMatchingAttachment {
        message_id: u64,
        family: MediaFamily,
    },

    #[error("channel {0} not found")]
    ChannelNotFound(u64),

    #[error("message {0} not found")]
    MessageNotFound(u64),

    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),
}

pub struct SourceResolver<'a> {
    lookup: &'a dyn ChannelLookup,
    family: MediaFamily,
}

impl<'a> SourceResolver<'a> {
    pub fn new(lookup: &'a dyn ChannelLookup, family: MediaFamily) -> Self {
        Self { lookup, family }
    }

    pub async fn resolve(
        &self,
        invocation: &Invocation,
        reply: &ProgressiveReply,
    ) -> Result<ResolvedSource, ResolutionError> {
        let explicit = match &invocation.input {
            InvocationInput::MessageContext { target } => {
                return self.from_message(invocation.channel_id, target, reply).await;
            }
            InvocationInput::Slash { url } => url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty()),
        };

        let working = match explicit {
            Some(url) => ResolvedSource {
                url: url.to_string(),
                origin: None,
            },
            None => {
                reply.add_data_line(
                    ReplyKey::Log,
                    format!("No URL provided, getting {} from channel", self.family),
                );
                reply.update(false).await;
                self.scan_channel(invocation.channel_id, reply).await?
            }
        };

        let parsed =
            Url::parse(&working.url).map_err(|_| ResolutionError::InvalidUrl(working.url.clone()))?;
        match permalink_target(&parsed, invocation.guild_id) {
            Some((channel_id, message_id)) => {
                reply.add_data_line(ReplyKey::Log, "Resolving message URL");
                reply.update(false).await;
                self.dereference(channel_id, message_id, reply).await
            }
            None => Ok(working),
        }
    }

    async fn scan_channel(
        &self,
        channel_id: u64,
        reply: &ProgressiveReply,
    ) -> Result<ResolvedSource, ResolutionError> {
        let messages = self.lookup.fetch_messages(channel_id, SCAN_LIMIT).await?;
        debug!("Scanning {} messages in channel {}", messages.len(), channel_id);

        for message in &messages {
            if let Some(attachment) = pick_attachment(message, self.family) {
                return Ok(self.accept(channel_id, message, attachment, reply).await);
            }
        }

        reply.add_data_line(ReplyKey::Log, format!("No {} found.", self.family));
        Err(ResolutionError::NoSourceInChannel {
            family: self.family,
            limit: SCAN_LIMIT,
        })
    }

    async fn dereference(
        &self,
        channel_id: u64,
        message_id: u64,
        reply: &ProgressiveReply,
    ) -> Result<ResolvedSource, ResolutionError> {
        if self.lookup.fetch_channel(channel_id).await?.is_none() {
            reply.add_data_line(ReplyKey::Log, "Text channel not found");
            return Err(ResolutionError::ChannelNotFound(channel_id));
        }

        let Some(message) = self.lookup.fetch_message(channel_id, message_id).await? else {
            reply.add_data_line(ReplyKey::Log, "Message not found");
            return Err(ResolutionError::MessageNotFound(message_id));
        };

        self.from_message(channel_id, &message, reply).await
    }

    async fn from_message(
        &self,
        channel_id: u64,
        message: &MessageRef,
        reply: &ProgressiveReply,
    ) -> Result<ResolvedSource, ResolutionError> {
        match pick_attachment(message, self.family) {
            Some(attachment) => Ok(self.accept(channel_id, message, attachment, reply).await),
            None => {
                reply.add_data_line(
                    ReplyKey::Log,
                    format!("No {} attached to message {}", self.family, message.id),
                );
                Err(ResolutionError::NoMatchingAttachment {
                    message_id: message.id,
                    family: self.family,
                })
            }
        }
    }

    async fn accept(
        &self,
        channel_id: u64,
        message: &MessageRef,
        attachment: &AttachmentRef,
        reply: &ProgressiveReply,
    ) -> ResolvedSource {
        reply.add_data_line(
            ReplyKey::Log,
            format!("Using {} from message {}", self.family, message.id),
        );
        reply.update(false).await;
        ResolvedSource {
            url: attachment.url.clone(),
            origin: Some((channel_id, message.id)),
        }
    }
}

/// First attachment whose declared type fits the family. Attachments with no
/// declared type are accepted optimistically.
pub fn pick_attachment(message: &MessageRef, family: MediaFamily) -> Option<&AttachmentRef> {
    message.attachments.iter().find(|attachment| {
        attachment
            .content_type
            .as_deref()
            .map_or(true, |ct| family.accepts_mime(ct))
    })
}

/// `(channel id, message id)` for a permalink into the invoking guild.
pub fn permalink_target(url: &Url, guild_id: Option<u64>) -> Option<(u64, u64)> {
    if url.host_str() != Some(PERMALINK_HOST) {
        return None;
    }
    let guild_id = guild_id?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["channels", guild, channel, message] if guild.parse::<u64>().ok()? == guild_id => {
            Some((channel.parse().ok()?, message.parse().ok()?))
        }
        _ => None,
    }
}
