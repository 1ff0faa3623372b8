use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::{player::GuildPlayer, registry::PlayerRegistry};

const USERS_LEFT_NOTICE: &str = "All users have left the voice channel. The player has been paused.";
const AUTO_RESUMED_NOTICE: &str = "User presence detected, automatically resuming the player.";

/// Pauses players nobody listens to and resumes them when someone comes back.
pub struct VoicePresence {
    registry: Arc<PlayerRegistry>,
}

impl VoicePresence {
    pub fn new(registry: Arc<PlayerRegistry>) -> Self {
        Self { registry }
    }

    /// Call after the gateway cache reflects a member moving between channels.
    pub async fn on_voice_move(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        is_bot: bool,
        left: Option<ChannelId>,
        joined: Option<ChannelId>,
    ) {
        if let Some(left) = left {
            self.check_auto_pause(guild_id, left).await;
        }
        if let Some(joined) = joined {
            self.check_auto_resume(guild_id, joined, user_id, is_bot).await;
            let gateway = &self.registry.services().gateway;
            if gateway.current_user_id() == Some(user_id) {
                self.check_auto_pause(guild_id, joined).await;
            }
        }
    }

    async fn check_auto_pause(&self, guild_id: GuildId, channel_left: ChannelId) {
        let Some(player) = self.registry.get_existing(guild_id) else {
            return;
        };
        if player.is_destroyed() {
            return;
        }
        if player
            .current_voice_channel()
            .is_some_and(|current| current != channel_left)
        {
            return;
        }
        if !player.human_listeners().is_empty() || player.is_paused() {
            return;
        }

        match player.pause().await {
            Ok(()) => {
                info!("⏸️ Auto-paused guild {}, nobody is listening", guild_id);
                notify(&player, USERS_LEFT_NOTICE).await;
            }
            Err(e) => warn!("Auto-pause failed in guild {}: {}", guild_id, e),
        }
    }

    async fn check_auto_resume(&self, guild_id: GuildId, joined: ChannelId, user_id: UserId, is_bot: bool) {
        let services = self.registry.services();
        if is_bot && services.gateway.current_user_id() != Some(user_id) {
            return;
        }
        let Some(player) = self.registry.get_existing(guild_id) else {
            return;
        };
        if player.is_destroyed()
            || !player.is_paused()
            || player.playing_track().is_none()
            || player.current_voice_channel() != Some(joined)
            || player.human_listeners().is_empty()
            || !services.guild_config.auto_resume(guild_id)
        {
            return;
        }

        match player.play().await {
            Ok(()) => {
                info!("▶️ Auto-resumed guild {}", guild_id);
                notify(&player, AUTO_RESUMED_NOTICE).await;
            }
            Err(e) => warn!("Auto-resume failed in guild {}: {}", guild_id, e),
        }
    }
}

async fn notify(player: &GuildPlayer, content: &str) {
    let Some(channel_id) = player.active_text_channel() else {
        return;
    };
    let gateway = Arc::clone(&player.services().gateway);
    if let Err(e) = gateway.send_message(channel_id, content).await {
        debug!("Presence notice failed in guild {}: {}", player.guild_id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{context, Harness, GUILD};

    #[tokio::test]
    async fn test_pauses_when_last_listener_leaves() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.discord.add_text_channel(GUILD, ChannelId::new(500), true);
        let registry = Arc::new(PlayerRegistry::new(harness.services.clone(), 1.0));
        let player = registry.get_or_create(GUILD);
        player.queue(context("A", 1)).await.unwrap();
        let presence = VoicePresence::new(Arc::clone(&registry));

        harness.discord.set_voice_state(GUILD, UserId::new(1), None);
        presence
            .on_voice_move(GUILD, UserId::new(1), false, Some(ChannelId::new(100)), None)
            .await;

        assert!(player.is_paused());
        assert_eq!(
            harness.discord.sent_messages(),
            vec![(ChannelId::new(500), USERS_LEFT_NOTICE.to_string())]
        );
    }

    #[tokio::test]
    async fn test_resume_requires_auto_resume_flag() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let registry = Arc::new(PlayerRegistry::new(harness.services.clone(), 1.0));
        let player = registry.get_or_create(GUILD);
        player.queue(context("A", 1)).await.unwrap();
        player.pause().await.unwrap();
        let presence = VoicePresence::new(Arc::clone(&registry));

        harness.listener(2, 100);
        presence
            .on_voice_move(GUILD, UserId::new(2), false, None, Some(ChannelId::new(100)))
            .await;

        // the harness guild config has auto resume disabled
        assert!(player.is_paused());
    }

    #[tokio::test]
    async fn test_resumes_when_listener_returns() {
        let harness = Harness::with_guild_config(true, true);
        harness.listener(1, 100);
        harness.discord.add_text_channel(GUILD, ChannelId::new(500), true);
        let registry = Arc::new(PlayerRegistry::new(harness.services.clone(), 1.0));
        let player = registry.get_or_create(GUILD);
        player.queue(context("A", 1)).await.unwrap();
        let presence = VoicePresence::new(Arc::clone(&registry));

        harness.discord.set_voice_state(GUILD, UserId::new(1), None);
        presence
            .on_voice_move(GUILD, UserId::new(1), false, Some(ChannelId::new(100)), None)
            .await;
        assert!(player.is_paused());

        harness.listener(1, 100);
        presence
            .on_voice_move(GUILD, UserId::new(1), false, None, Some(ChannelId::new(100)))
            .await;
        assert!(player.is_playing());
        assert_eq!(
            harness.discord.sent_messages().last().map(|(_, m)| m.as_str()),
            Some(AUTO_RESUMED_NOTICE)
        );
    }

    #[tokio::test]
    async fn test_leaving_another_channel_is_ignored() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.listener(2, 200);
        let registry = Arc::new(PlayerRegistry::new(harness.services.clone(), 1.0));
        let player = registry.get_or_create(GUILD);
        player.queue(context("A", 1)).await.unwrap();
        let presence = VoicePresence::new(Arc::clone(&registry));

        harness.discord.set_voice_state(GUILD, UserId::new(2), None);
        presence
            .on_voice_move(GUILD, UserId::new(2), false, Some(ChannelId::new(200)), None)
            .await;
        assert!(player.is_playing());
    }
}
