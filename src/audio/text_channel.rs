use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use tracing::debug;

use crate::gateway::DiscordGateway;

/// Remembers which text channel each guild last used for music commands.
#[derive(Debug, Default)]
pub struct MusicTextChannelProvider {
    channels: DashMap<GuildId, ChannelId>,
}

impl MusicTextChannelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_music_channel(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.channels.insert(guild_id, channel_id);
    }

    pub fn music_channel_id(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.channels.get(&guild_id).map(|c| *c)
    }

    /// The remembered channel when the bot can still talk there, otherwise the first
    /// channel of the guild it can talk in.
    pub fn music_channel(&self, guild_id: GuildId, gateway: &dyn DiscordGateway) -> Option<ChannelId> {
        if let Some(channel_id) = self.music_channel_id(guild_id) {
            if gateway.can_talk_in(guild_id, channel_id) {
                return Some(channel_id);
            }
        }
        debug!(
            "No usable music text channel in guild {}, looking for one we can talk in",
            guild_id
        );
        gateway.text_channels(guild_id).into_iter().next()
    }

    pub fn forget(&self, guild_id: GuildId) {
        self.channels.remove(&guild_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeDiscord;

    #[test]
    fn test_falls_back_to_first_talkable_channel() {
        let discord = FakeDiscord::new();
        let guild = GuildId::new(1);
        discord.add_text_channel(guild, ChannelId::new(50), true);
        discord.add_text_channel(guild, ChannelId::new(60), true);

        let provider = MusicTextChannelProvider::new();
        assert_eq!(provider.music_channel(guild, &discord), Some(ChannelId::new(50)));

        provider.set_music_channel(guild, ChannelId::new(60));
        assert_eq!(provider.music_channel(guild, &discord), Some(ChannelId::new(60)));

        discord.add_text_channel(guild, ChannelId::new(60), false);
        assert_eq!(provider.music_channel(guild, &discord), Some(ChannelId::new(50)));
    }
}
