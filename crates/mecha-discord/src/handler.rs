use crate::lookup::{message_ref, SerenityLookup};
use crate::registry::{CommandRegistry, MediaInit};
use crate::reply::{reject, InteractionReplySink};
use crate::thread_ping::{
    is_newly_created, load_guild_roles, ping_thread, thread_created_at, PingableRoles,
};
use mecha_config::Config;
use mecha_core::{
    builtin, ChannelLookup, CommandKind, Invocation, InvocationInput, MessageRef, Pipeline,
};
use mecha_exec::ProcessRunner;
use serenity::all::{
    CommandInteraction, CommandType, Context, EventHandler, GuildChannel, GuildId, Http,
    Interaction, Ready, ResolvedTarget, Role, RoleId, Timestamp,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Commands and the pipeline they run on, built once the gateway is ready.
struct Dispatch {
    pipeline: Option<Arc<Pipeline>>,
    registry: CommandRegistry,
}

pub struct Handler {
    config: Arc<Config>,
    runner: Arc<dyn ProcessRunner>,
    dispatch: OnceCell<Dispatch>,
    pingable: PingableRoles,
}

impl Handler {
    pub fn new(config: Arc<Config>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            config,
            runner,
            dispatch: OnceCell::new(),
            pingable: PingableRoles::new(),
        }
    }

    async fn build_dispatch(&self, http: &Arc<Http>) -> Dispatch {
        let lookup: Arc<dyn ChannelLookup> = Arc::new(SerenityLookup::new(http.clone()));
        let pipeline = media_pipeline(&self.config, lookup, self.runner.clone());

        let registry =
            CommandRegistry::initialise(builtin(), &MediaInit::new(pipeline.clone())).await;
        if registry.is_empty() {
            warn!("No commands initialised");
        }

        Dispatch {
            pipeline: pipeline.ok(),
            registry,
        }
    }

    async fn handle_command(&self, ctx: &Context, interaction: CommandInteraction) {
        let name = interaction.data.name.clone();
        let Some(kind) = command_kind(interaction.data.kind) else {
            debug!("Ignoring command {} of kind {:?}", name, interaction.data.kind);
            return;
        };

        let found = self.dispatch.get().and_then(|dispatch| {
            let command = dispatch.registry.get(&name, kind)?;
            let pipeline = dispatch.pipeline.clone()?;
            Some((command, pipeline))
        });
        let Some((command, pipeline)) = found else {
            warn!("Received unknown command {}", name);
            if let Err(e) = reject(
                &ctx.http,
                &interaction,
                "Unknown command",
                &format!("`{}` is not available right now.", name),
            )
            .await
            {
                error!("{:#}", e);
            }
            return;
        };

        let url = interaction
            .data
            .options
            .iter()
            .find(|option| option.name == "url")
            .and_then(|option| option.value.as_str())
            .map(str::to_string);
        let target = match interaction.data.target() {
            Some(ResolvedTarget::Message(message)) => Some(message_ref(message)),
            _ => None,
        };
        let Some(input) = invocation_input(kind, url, target) else {
            warn!("Context command {} arrived without a target message", name);
            if let Err(e) = reject(
                &ctx.http,
                &interaction,
                "No message",
                "Couldn't read the message this command was used on.",
            )
            .await
            {
                error!("{:#}", e);
            }
            return;
        };

        let invocation = Invocation {
            command_name: name.clone(),
            guild_id: interaction.guild_id.map(|id| id.get()),
            channel_id: interaction.channel_id.get(),
            user_id: interaction.user.id.get(),
            input,
        };
        info!(
            user_id = invocation.user_id,
            channel_id = invocation.channel_id,
            "Running command {}",
            name
        );

        let sink = Arc::new(InteractionReplySink::new(ctx.http.clone(), interaction));
        let state = pipeline.execute(command.as_ref(), &invocation, sink).await;
        debug!("Command {} finished with status {:?}", name, state.status());
    }
}

/// Media commands need an explicit runtime mode and resolvable media settings.
fn media_pipeline(
    config: &Config,
    lookup: Arc<dyn ChannelLookup>,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Arc<Pipeline>, String> {
    let mode = config.core.mode().map_err(|e| e.to_string())?;
    let media = config
        .media
        .resolve(&config.core.log_dir)
        .map_err(|e| e.to_string())?;
    Pipeline::from_media(&media, mode, lookup, runner)
        .map(Arc::new)
        .map_err(|e| e.to_string())
}

fn command_kind(kind: CommandType) -> Option<CommandKind> {
    match kind {
        CommandType::ChatInput => Some(CommandKind::Slash),
        CommandType::Message => Some(CommandKind::MessageContext),
        _ => None,
    }
}

fn invocation_input(
    kind: CommandKind,
    url: Option<String>,
    target: Option<MessageRef>,
) -> Option<InvocationInput> {
    match kind {
        CommandKind::Slash => Some(InvocationInput::Slash { url }),
        CommandKind::MessageContext => target.map(|target| InvocationInput::MessageContext { target }),
    }
}

#[async_trait::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(username = %ready.user.name, "Discord bot connected");

        let dispatch = self
            .dispatch
            .get_or_init(|| self.build_dispatch(&ctx.http))
            .await;
        let registered = match self.config.core.mode() {
            Ok(mode) => {
                dispatch
                    .registry
                    .register(&ctx.http, mode, self.config.discord.dev_guild_id)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = registered {
            error!("Failed to register commands: {:#}", e);
        }

        for guild in &ready.guilds {
            if let Err(e) = load_guild_roles(&ctx.http, &self.pingable, guild.id).await {
                warn!("{:#}", e);
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            self.handle_command(&ctx, command).await;
        }
    }

    async fn thread_create(&self, ctx: Context, thread: GuildChannel) {
        let created = thread_created_at(&thread).unix_timestamp();
        if !is_newly_created(created, Timestamp::now().unix_timestamp()) {
            debug!("Thread {} is not new, skipping ping", thread.id);
            return;
        }
        if let Err(e) = ping_thread(&ctx.http, &self.pingable, thread.guild_id, thread.id).await {
            warn!("Thread ping in {} failed: {:#}", thread.id, e);
        }
    }

    async fn guild_role_create(&self, _ctx: Context, new: Role) {
        self.pingable
            .upsert_role(new.guild_id.get(), new.id.get(), &new.name);
    }

    async fn guild_role_update(&self, _ctx: Context, _old: Option<Role>, new: Role) {
        self.pingable
            .upsert_role(new.guild_id.get(), new.id.get(), &new.name);
    }

    async fn guild_role_delete(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        removed_role_id: RoleId,
        _removed: Option<Role>,
    ) {
        self.pingable.remove_role(guild_id.get(), removed_role_id.get());
    }
}
