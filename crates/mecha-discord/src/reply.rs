use anyhow::{Context as _, Result};
use mecha_core::{CardColor, ReplyPayload, ReplySink};
use serenity::all::{
    Colour, CommandInteraction, CreateAttachment, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse, Http,
};
use std::sync::Arc;

/// Reply sink bound to one command interaction's deferred response.
pub struct InteractionReplySink {
    http: Arc<Http>,
    interaction: CommandInteraction,
}

impl InteractionReplySink {
    pub fn new(http: Arc<Http>, interaction: CommandInteraction) -> Self {
        Self { http, interaction }
    }
}

#[async_trait::async_trait]
impl ReplySink for InteractionReplySink {
    async fn defer(&self) -> Result<()> {
        self.interaction
            .create_response(
                &self.http,
                CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
            )
            .await
            .context("failed to defer interaction")
    }

    async fn edit(&self, payload: ReplyPayload) -> Result<()> {
        let edit = match payload {
            ReplyPayload::Attachment { path, filename } => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                EditInteractionResponse::new()
                    .embeds(Vec::new())
                    .new_attachment(CreateAttachment::bytes(data, filename))
            }
            ReplyPayload::Card {
                color,
                title,
                description,
            } => EditInteractionResponse::new().embed(card_embed(color, &title, &description)),
        };

        self.interaction
            .edit_response(&self.http, edit)
            .await
            .context("failed to edit interaction response")?;
        Ok(())
    }
}

pub fn card_embed(color: CardColor, title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::new()
        .colour(Colour::new(color.hex()))
        .title(title)
        .description(description)
}

/// Immediate ephemeral card, used when no pipeline runs for the interaction.
pub async fn reject(http: &Arc<Http>, interaction: &CommandInteraction, title: &str, description: &str) -> Result<()> {
    interaction
        .create_response(
            http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(card_embed(CardColor::Red, title, description))
                    .ephemeral(true),
            ),
        )
        .await
        .context("failed to send rejection")
}
