use anyhow::{bail, Result};
use mecha_config::RuntimeMode;
use mecha_core::{CommandKind, MediaCommand, Pipeline};
use serenity::all::{
    Command, CommandOptionType, CommandType, CreateCommand, CreateCommandOption, GuildId, Http,
};
use std::sync::Arc;
use tracing::{error, info};

/// Per-command startup check.
#[async_trait::async_trait]
pub trait CommandInit: Send + Sync {
    async fn init(&self, command: &dyn MediaCommand) -> Result<()>;
}

/// Media commands need validated media settings and their directories.
pub struct MediaInit {
    pipeline: std::result::Result<Arc<Pipeline>, String>,
}

impl MediaInit {
    pub fn new(pipeline: std::result::Result<Arc<Pipeline>, String>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl CommandInit for MediaInit {
    async fn init(&self, _command: &dyn MediaCommand) -> Result<()> {
        match &self.pipeline {
            Ok(pipeline) => {
                pipeline.store().ensure_dirs().await?;
                Ok(())
            }
            Err(reason) => bail!("{}", reason),
        }
    }
}

/// Commands that initialised successfully, keyed by name and kind.
pub struct CommandRegistry {
    commands: Vec<Arc<dyn MediaCommand>>,
}

impl CommandRegistry {
    /// Initialises every candidate. A failing command is logged and left
    /// out; the others are unaffected.
    pub async fn initialise(candidates: Vec<Arc<dyn MediaCommand>>, init: &dyn CommandInit) -> Self {
        let mut commands = Vec::with_capacity(candidates.len());
        for command in candidates {
            match init.init(command.as_ref()).await {
                Ok(()) => {
                    info!("Initialised command {}", command.name());
                    commands.push(command);
                }
                Err(e) => error!("Couldn't initialise command {}: {:#}", command.name(), e),
            }
        }
        Self { commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.commands.iter().map(|c| c.name()).collect()
    }

    pub fn get(&self, name: &str, kind: CommandKind) -> Option<Arc<dyn MediaCommand>> {
        self.commands
            .iter()
            .find(|c| c.name() == name && c.kind() == kind)
            .cloned()
    }

    pub fn definitions(&self) -> Vec<CreateCommand> {
        self.commands.iter().map(|c| definition(c.as_ref())).collect()
    }

    /// Registers globally in production and on the dev guild otherwise.
    pub async fn register(&self, http: &Arc<Http>, mode: RuntimeMode, dev_guild_id: Option<u64>) -> Result<()> {
        let definitions = self.definitions();
        let count = definitions.len();
        match mode {
            RuntimeMode::Prod => {
                Command::set_global_commands(http, definitions).await?;
                info!("Registered {} global commands", count);
            }
            RuntimeMode::Dev => {
                let Some(guild_id) = dev_guild_id else {
                    bail!("DEV_GUILD_ID is not set, cannot register dev commands");
                };
                GuildId::new(guild_id).set_commands(http, definitions).await?;
                info!(guild_id, "Registered {} guild commands", count);
            }
        }
        Ok(())
    }
}

fn definition(command: &dyn MediaCommand) -> CreateCommand {
    match command.kind() {
        CommandKind::Slash => CreateCommand::new(command.name())
            .kind(CommandType::ChatInput)
            .description(command.description())
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "url",
                    format!(
                        "The url of the {} to convert. May be a link to a message",
                        command.family()
                    ),
                )
                .required(false),
            ),
        CommandKind::MessageContext => {
            CreateCommand::new(command.name()).kind(CommandType::Message)
        }
    }
}
