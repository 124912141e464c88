//! Chat platform collaborators. The pipeline only sees these types; the
//! gateway adapter translates to and from its own models.

use anyhow::Result;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: u64,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: u64,
    pub guild_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationInput {
    Slash { url: Option<String> },
    MessageContext { target: MessageRef },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command_name: String,
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    pub user_id: u64,
    pub input: InvocationInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardColor {
    Red,
    Blue,
    Green,
    Yellow,
}

impl CardColor {
    pub fn hex(self) -> u32 {
        match self {
            CardColor::Red => 0xED4245,
            CardColor::Blue => 0x3498DB,
            CardColor::Green => 0x57F287,
            CardColor::Yellow => 0xFEE75C,
        }
    }
}

/// Rendered content of the single reply message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    Attachment {
        path: PathBuf,
        filename: String,
    },
    Card {
        color: CardColor,
        title: String,
        description: String,
    },
}

#[async_trait::async_trait]
pub trait ReplySink: Send + Sync {
    /// Acknowledges the interaction and reserves the reply slot.
    async fn defer(&self) -> Result<()>;
    /// Replaces the reply content.
    async fn edit(&self, payload: ReplyPayload) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ChannelLookup: Send + Sync {
    async fn fetch_channel(&self, channel_id: u64) -> Result<Option<ChannelRef>>;
    /// Newest first.
    async fn fetch_messages(&self, channel_id: u64, limit: u8) -> Result<Vec<MessageRef>>;
    async fn fetch_message(&self, channel_id: u64, message_id: u64) -> Result<Option<MessageRef>>;
}
