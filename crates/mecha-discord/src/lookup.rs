use anyhow::Result;
use mecha_core::{AttachmentRef, ChannelLookup, ChannelRef, MessageRef};
use serenity::all::{Attachment, Channel, ChannelId, GetMessages, Http, Message, MessageId};
use std::sync::Arc;
use tracing::debug;

/// Channel and message lookups over the REST API.
pub struct SerenityLookup {
    http: Arc<Http>,
}

impl SerenityLookup {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl ChannelLookup for SerenityLookup {
    async fn fetch_channel(&self, channel_id: u64) -> Result<Option<ChannelRef>> {
        match ChannelId::new(channel_id).to_channel(&self.http).await {
            Ok(Channel::Guild(channel)) => Ok(Some(ChannelRef {
                id: channel.id.get(),
                guild_id: Some(channel.guild_id.get()),
            })),
            Ok(Channel::Private(channel)) => Ok(Some(ChannelRef {
                id: channel.id.get(),
                guild_id: None,
            })),
            Ok(_) => Ok(None),
            Err(e) if is_missing(&e) => {
                debug!("Channel {} not visible: {}", channel_id, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_messages(&self, channel_id: u64, limit: u8) -> Result<Vec<MessageRef>> {
        let messages = ChannelId::new(channel_id)
            .messages(&self.http, GetMessages::new().limit(limit))
            .await?;
        Ok(messages.iter().map(message_ref).collect())
    }

    async fn fetch_message(&self, channel_id: u64, message_id: u64) -> Result<Option<MessageRef>> {
        match ChannelId::new(channel_id)
            .message(&self.http, MessageId::new(message_id))
            .await
        {
            Ok(message) => Ok(Some(message_ref(&message))),
            Err(e) if is_missing(&e) => {
                debug!("Message {} not visible: {}", message_id, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Unknown or inaccessible resources read as absent.
fn is_missing(err: &serenity::Error) -> bool {
    match err {
        serenity::Error::Http(http) => matches!(
            http.status_code().map(|status| status.as_u16()),
            Some(403 | 404)
        ),
        _ => false,
    }
}

pub fn message_ref(message: &Message) -> MessageRef {
    MessageRef {
        id: message.id.get(),
        attachments: message.attachments.iter().map(attachment_ref).collect(),
    }
}

fn attachment_ref(attachment: &Attachment) -> AttachmentRef {
    AttachmentRef {
        url: attachment.url.clone(),
        content_type: attachment.content_type.clone(),
    }
}
