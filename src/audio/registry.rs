use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::{
    error::PlayerError,
    player::{GuildPlayer, PlayerServices},
};

/// Process-wide map of guild players.
///
/// At most one live player exists per guild; creation happens under the map
/// entry so concurrent callers always end up with the same instance.
pub struct PlayerRegistry {
    players: DashMap<GuildId, Arc<GuildPlayer>>,
    services: PlayerServices,
    default_volume: f32,
}

impl PlayerRegistry {
    pub fn new(services: PlayerServices, default_volume: f32) -> Self {
        Self {
            players: DashMap::new(),
            services,
            default_volume,
        }
    }

    pub fn services(&self) -> &PlayerServices {
        &self.services
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildPlayer> {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                info!("🎛️ New player for guild {}", guild_id);
                GuildPlayer::new(guild_id, self.services.clone(), self.default_volume)
            })
            .clone()
    }

    pub fn get_existing(&self, guild_id: GuildId) -> Option<Arc<GuildPlayer>> {
        self.players.get(&guild_id).map(|p| Arc::clone(&p))
    }

    /// Removes the guild's player and destroys it. Returns false when there was none.
    pub async fn destroy_player(&self, guild_id: GuildId) -> bool {
        let Some((_, player)) = self.players.remove(&guild_id) else {
            debug!("No player to destroy in guild {}", guild_id);
            return false;
        };
        player.destroy().await;
        true
    }

    pub fn players(&self) -> Vec<Arc<GuildPlayer>> {
        self.players.iter().map(|p| Arc::clone(p.value())).collect()
    }

    pub fn playing_players(&self) -> Vec<Arc<GuildPlayer>> {
        self.players
            .iter()
            .filter(|p| p.is_playing())
            .map(|p| Arc::clone(p.value()))
            .collect()
    }

    pub fn playing_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_playing()).count()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Destroys every player. Used once persistence has captured their state.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.players.iter().map(|p| *p.key()).collect();
        for guild_id in &guilds {
            self.destroy_player(*guild_id).await;
        }
        info!("🛑 Shut down {} players", guilds.len());
    }
}

/// Caps how many guilds may play at once. A negative limit disables the cap.
#[derive(Debug, Clone, Copy)]
pub struct PlayerLimiter {
    limit: i64,
}

impl PlayerLimiter {
    pub fn new(limit: i64) -> Self {
        Self { limit }
    }

    /// Guilds with something already queued are always let through.
    pub fn check_limit(&self, guild_id: GuildId, registry: &PlayerRegistry) -> bool {
        if registry
            .get_existing(guild_id)
            .is_some_and(|p| p.track_count() > 0)
        {
            return true;
        }
        self.limit < 0 || (registry.playing_count() as i64) < self.limit
    }

    pub fn ensure_allowed(&self, guild_id: GuildId, registry: &PlayerRegistry) -> Result<(), PlayerError> {
        if self.check_limit(guild_id, registry) {
            Ok(())
        } else {
            info!("🚦 Player limit of {} reached, refusing guild {}", self.limit, guild_id);
            Err(PlayerError::PlayerLimitReached)
        }
    }
}
