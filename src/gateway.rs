//! Discord lookups the audio core needs, behind a trait so the core can run
//! against an in-memory guild in tests.

use anyhow::Result;
use async_trait::async_trait;
use serenity::{
    all::{Cache, ChannelType, Http},
    model::{
        id::{ChannelId, GuildId, UserId},
        Permissions,
    },
};
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Shard that receives events for `guild_id`.
pub fn shard_id_for(guild_id: GuildId, shard_count: u32) -> u32 {
    ((guild_id.get() >> 22) % u64::from(shard_count.max(1))) as u32
}

/// Snapshot of a voice channel taken from the gateway cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceChannelInfo {
    pub name: String,
    /// Zero means unlimited.
    pub user_limit: u32,
    pub members: Vec<UserId>,
    pub humans: Vec<UserId>,
}

impl VoiceChannelInfo {
    pub fn is_full(&self) -> bool {
        self.user_limit > 0 && self.members.len() >= self.user_limit as usize
    }
}

#[async_trait]
pub trait DiscordGateway: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    fn has_guild(&self, guild_id: GuildId) -> bool;

    fn member_exists(&self, guild_id: GuildId, user_id: UserId) -> bool;

    fn member_voice_channel(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId>;

    fn self_voice_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        let me = self.current_user_id()?;
        self.member_voice_channel(guild_id, me)
    }

    fn voice_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<VoiceChannelInfo>;

    fn self_permissions_in(&self, guild_id: GuildId, channel_id: ChannelId) -> Permissions;

    /// Admins, server managers, the owner and members with a "DJ" role.
    fn is_moderator(&self, guild_id: GuildId, user_id: UserId) -> bool;

    /// Text channels the bot can post in, in display order.
    fn text_channels(&self, guild_id: GuildId) -> Vec<ChannelId>;

    fn can_talk_in(&self, guild_id: GuildId, channel_id: ChannelId) -> bool {
        let perms = self.self_permissions_in(guild_id, channel_id);
        perms.contains(Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES)
    }

    async fn send_message(&self, channel_id: ChannelId, content: &str) -> Result<()>;
}

/// Gateway backed by serenity's cache and HTTP client.
///
/// The client only exists after the event handler was built, so the handles are
/// bound once the client is constructed. Lookups before that return nothing.
#[derive(Default)]
pub struct SerenityGateway {
    handles: OnceLock<(Arc<Cache>, Arc<Http>)>,
}

impl SerenityGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, cache: Arc<Cache>, http: Arc<Http>) {
        if self.handles.set((cache, http)).is_err() {
            warn!("Gateway handles were already bound");
        }
    }

    fn cache(&self) -> Option<&Arc<Cache>> {
        self.handles.get().map(|(cache, _)| cache)
    }
}

#[async_trait]
impl DiscordGateway for SerenityGateway {
    fn current_user_id(&self) -> Option<UserId> {
        self.cache().map(|cache| cache.current_user().id)
    }

    fn has_guild(&self, guild_id: GuildId) -> bool {
        self.cache().is_some_and(|cache| cache.guild(guild_id).is_some())
    }

    fn member_exists(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.cache()
            .and_then(|cache| cache.guild(guild_id))
            .is_some_and(|guild| guild.members.contains_key(&user_id))
    }

    fn member_voice_channel(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
        let guild = self.cache()?.guild(guild_id)?;
        guild.voice_states.get(&user_id)?.channel_id
    }

    fn voice_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<VoiceChannelInfo> {
        let guild = self.cache()?.guild(guild_id)?;
        let channel = guild.channels.get(&channel_id)?;
        if !matches!(channel.kind, ChannelType::Voice | ChannelType::Stage) {
            return None;
        }

        let members: Vec<UserId> = guild
            .voice_states
            .values()
            .filter(|state| state.channel_id == Some(channel_id))
            .map(|state| state.user_id)
            .collect();
        let humans = members
            .iter()
            .copied()
            .filter(|id| !guild.members.get(id).is_some_and(|m| m.user.bot))
            .collect();

        Some(VoiceChannelInfo {
            name: channel.name.clone(),
            user_limit: channel.user_limit.unwrap_or(0),
            members,
            humans,
        })
    }

    fn self_permissions_in(&self, guild_id: GuildId, channel_id: ChannelId) -> Permissions {
        let Some(cache) = self.cache() else {
            return Permissions::empty();
        };
        let me = cache.current_user().id;
        let Some(guild) = cache.guild(guild_id) else {
            return Permissions::empty();
        };
        match (guild.channels.get(&channel_id), guild.members.get(&me)) {
            (Some(channel), Some(member)) => guild.user_permissions_in(channel, member),
            _ => Permissions::empty(),
        }
    }

    fn is_moderator(&self, guild_id: GuildId, user_id: UserId) -> bool {
        let Some(guild) = self.cache().and_then(|cache| cache.guild(guild_id)) else {
            return false;
        };
        if guild.owner_id == user_id {
            return true;
        }
        let Some(member) = guild.members.get(&user_id) else {
            return false;
        };
        let has_dj_role = member.roles.iter().any(|role_id| {
            guild
                .roles
                .get(role_id)
                .is_some_and(|role| role.name.eq_ignore_ascii_case("dj"))
        });
        #[allow(deprecated)]
        let perms = guild.member_permissions(member);
        has_dj_role || perms.administrator() || perms.manage_guild()
    }

    fn text_channels(&self, guild_id: GuildId) -> Vec<ChannelId> {
        let Some(cache) = self.cache() else {
            return Vec::new();
        };
        let me = cache.current_user().id;
        let Some(guild) = cache.guild(guild_id) else {
            return Vec::new();
        };
        let Some(member) = guild.members.get(&me) else {
            return Vec::new();
        };

        let mut channels: Vec<_> = guild
            .channels
            .values()
            .filter(|channel| channel.kind == ChannelType::Text)
            .filter(|channel| {
                guild
                    .user_permissions_in(channel, member)
                    .contains(Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES)
            })
            .map(|channel| (channel.position, channel.id))
            .collect();
        channels.sort_unstable();
        channels.into_iter().map(|(_, id)| id).collect()
    }

    async fn send_message(&self, channel_id: ChannelId, content: &str) -> Result<()> {
        let (_, http) = self
            .handles
            .get()
            .ok_or_else(|| anyhow::anyhow!("gateway not bound yet"))?;
        channel_id.say(http, content).await?;
        Ok(())
    }
}
