//! Mechafoord Discord Adapter
//!
//! Gateway client, command registration and dispatch, interaction replies
//! and the thread ping.

pub mod handler;
pub mod lookup;
pub mod registry;
pub mod reply;
pub mod thread_ping;

pub use handler::Handler;
pub use registry::{CommandInit, CommandRegistry, MediaInit};
pub use reply::InteractionReplySink;

use anyhow::{Context as _, Result};
use mecha_config::Config;
use mecha_exec::{ProcessRunner, TokioProcessRunner};
use serenity::all::{Client, GatewayIntents, ShardManager};
use std::sync::Arc;
use tracing::info;

pub struct DiscordBot {
    client: Client,
}

impl DiscordBot {
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
        Self::with_runner(config, runner).await
    }

    pub async fn with_runner(config: Arc<Config>, runner: Arc<dyn ProcessRunner>) -> Result<Self> {
        let token = config.discord.token.clone();
        let client = Client::builder(&token, GatewayIntents::GUILDS)
            .event_handler(Handler::new(config, runner))
            .await
            .context("failed to create Discord client")?;
        Ok(Self { client })
    }

    pub fn shard_manager(&self) -> Arc<ShardManager> {
        self.client.shard_manager.clone()
    }

    /// Runs the gateway until the shards shut down.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting Discord client");
        self.client
            .start()
            .await
            .context("Discord client stopped with an error")
    }
}
