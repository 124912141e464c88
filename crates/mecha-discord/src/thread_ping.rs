//! Pings a guild's thread role whenever a thread is created, then deletes
//! the ping so only the notification remains.

use anyhow::{Context as _, Result};
use serenity::all::{ChannelId, CreateMessage, GuildChannel, GuildId, Http, Timestamp};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

const ROLE_NAMES: [&str; 3] = ["Thread Ping", "Ping Thread", "Thread"];

/// Thread create events also arrive when the bot gains access to an existing
/// thread; only threads created this recently are pinged.
const NEW_THREAD_WINDOW_SECS: i64 = 10;

pub fn is_pingable_name(name: &str) -> bool {
    ROLE_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name))
}

pub fn is_newly_created(created_unix: i64, now_unix: i64) -> bool {
    (now_unix - created_unix).abs() <= NEW_THREAD_WINDOW_SECS
}

/// Threads started from a message share that message's id, so the snowflake
/// time is only a fallback for threads without a creation timestamp.
pub fn thread_created_at(thread: &GuildChannel) -> Timestamp {
    thread
        .thread_metadata
        .as_ref()
        .and_then(|metadata| metadata.create_timestamp)
        .unwrap_or_else(|| thread.id.created_at())
}

/// Guild id to the role pinged for new threads.
#[derive(Default)]
pub struct PingableRoles {
    roles: RwLock<HashMap<u64, u64>>,
}

impl PingableRoles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces what is known about `guild_id` from its full role list.
    pub fn load_guild<'a>(&self, guild_id: u64, roles: impl IntoIterator<Item = (u64, &'a str)>) {
        let found = roles
            .into_iter()
            .filter(|(_, name)| is_pingable_name(name))
            .map(|(id, _)| id)
            .last();

        let mut map = self.roles.write().unwrap_or_else(|p| p.into_inner());
        match found {
            Some(role_id) => {
                info!(guild_id, role_id, "Thread ping role loaded");
                map.insert(guild_id, role_id);
            }
            None => {
                map.remove(&guild_id);
            }
        }
    }

    /// Applies a created or renamed role.
    pub fn upsert_role(&self, guild_id: u64, role_id: u64, name: &str) {
        let mut map = self.roles.write().unwrap_or_else(|p| p.into_inner());
        if is_pingable_name(name) {
            map.insert(guild_id, role_id);
        } else if map.get(&guild_id) == Some(&role_id) {
            map.remove(&guild_id);
        }
    }

    pub fn remove_role(&self, guild_id: u64, role_id: u64) {
        let mut map = self.roles.write().unwrap_or_else(|p| p.into_inner());
        if map.get(&guild_id) == Some(&role_id) {
            map.remove(&guild_id);
        }
    }

    pub fn role_for(&self, guild_id: u64) -> Option<u64> {
        self.roles
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&guild_id)
            .copied()
    }
}

/// Fetches a guild's roles and records its thread role.
pub async fn load_guild_roles(http: &Arc<Http>, roles: &PingableRoles, guild_id: GuildId) -> Result<()> {
    let fetched = guild_id
        .roles(http)
        .await
        .with_context(|| format!("failed to fetch roles of guild {}", guild_id))?;
    roles.load_guild(
        guild_id.get(),
        fetched.values().map(|role| (role.id.get(), role.name.as_str())),
    );
    Ok(())
}

/// Mentions the guild's thread role in a new thread and removes the message.
pub async fn ping_thread(http: &Arc<Http>, roles: &PingableRoles, guild_id: GuildId, thread_id: ChannelId) -> Result<()> {
    let Some(role_id) = roles.role_for(guild_id.get()) else {
        debug!("No thread ping role in guild {}", guild_id);
        return Ok(());
    };

    let message = thread_id
        .send_message(http, CreateMessage::new().content(format!("<@&{}>", role_id)))
        .await
        .context("failed to send thread ping")?;
    message
        .delete(http)
        .await
        .context("failed to delete thread ping")?;
    debug!("Pinged role {} in thread {}", role_id, thread_id);
    Ok(())
}
