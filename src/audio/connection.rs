use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::Songbird;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::audio::{
    backend::{PlaybackHandle, PlayerEventListener},
    error::PlayerError,
    local::LocalPlayer,
    relay::RelayPool,
};
use crate::executor::TaskExecutor;

/// Where audio is decoded and sent from. Chosen once at startup.
pub enum AudioBackend {
    /// Songbird's in-process driver.
    Local,
    /// Relay nodes; songbird only performs the voice gateway handshake.
    Remote(Arc<RelayPool>),
    #[cfg(test)]
    Fake(Arc<crate::audio::testing::FakeBackend>),
}

/// Connect, disconnect and create players without callers knowing the backend.
pub struct AudioConnectionFacade {
    songbird: Arc<Songbird>,
    http: reqwest::Client,
    backend: AudioBackend,
}

impl AudioConnectionFacade {
    pub fn new(songbird: Arc<Songbird>, http: reqwest::Client, backend: AudioBackend) -> Self {
        Self {
            songbird,
            http,
            backend,
        }
    }

    pub fn is_local(&self) -> bool {
        !matches!(self.backend, AudioBackend::Remote(_))
    }

    pub fn relay(&self) -> Option<&Arc<RelayPool>> {
        match &self.backend {
            AudioBackend::Remote(pool) => Some(pool),
            _ => None,
        }
    }

    pub async fn is_connected(&self, guild_id: GuildId) -> bool {
        #[cfg(test)]
        if let AudioBackend::Fake(fake) = &self.backend {
            return fake.is_connected(guild_id);
        }
        match self.songbird.get(guild_id) {
            Some(call) => call.lock().await.current_channel().is_some(),
            None => false,
        }
    }

    /// Called once the bot user is known.
    pub fn start(&self, user_id: UserId, executor: &TaskExecutor) {
        if let AudioBackend::Remote(pool) = &self.backend {
            pool.start(user_id, executor);
        }
    }

    pub async fn open_connection(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), PlayerError> {
        match &self.backend {
            AudioBackend::Local => {
                self.songbird
                    .join(guild_id, channel_id)
                    .await
                    .map_err(|e| PlayerError::Connection(e.to_string()))?;
            }
            AudioBackend::Remote(pool) => {
                let (info, _call) = self
                    .songbird
                    .join_gateway(guild_id, channel_id)
                    .await
                    .map_err(|e| PlayerError::Connection(e.to_string()))?;
                pool.connect_voice(guild_id, channel_id, info.session_id, info.token, info.endpoint)
                    .await?;
            }
            #[cfg(test)]
            AudioBackend::Fake(fake) => fake.connect(guild_id, channel_id)?,
        }
        info!("🔊 Voice connection opened in guild {} (channel {})", guild_id, channel_id);
        Ok(())
    }

    /// Leaves voice in the guild. Safe to call when not connected.
    pub async fn close_connection(&self, guild_id: GuildId) {
        match &self.backend {
            AudioBackend::Local => self.leave_gateway(guild_id).await,
            AudioBackend::Remote(pool) => {
                pool.disconnect(guild_id).await;
                self.leave_gateway(guild_id).await;
            }
            #[cfg(test)]
            AudioBackend::Fake(fake) => fake.disconnect(guild_id),
        }
    }

    async fn leave_gateway(&self, guild_id: GuildId) {
        if self.songbird.get(guild_id).is_none() {
            return;
        }
        match self.songbird.remove(guild_id).await {
            Ok(()) => debug!("👋 Left voice in guild {}", guild_id),
            Err(e) => warn!("Error leaving voice in guild {}: {}", guild_id, e),
        }
    }

    pub fn create_player(
        &self,
        guild_id: GuildId,
        listener: Weak<dyn PlayerEventListener>,
    ) -> Arc<dyn PlaybackHandle> {
        match &self.backend {
            AudioBackend::Local => Arc::new(LocalPlayer::new(
                guild_id,
                Arc::clone(&self.songbird),
                self.http.clone(),
                listener,
            )),
            AudioBackend::Remote(pool) => Arc::new(pool.create_player(guild_id, listener)),
            #[cfg(test)]
            AudioBackend::Fake(fake) => fake.create_player(guild_id, listener),
        }
    }

    pub async fn forward_voice_state(
        &self,
        guild_id: GuildId,
        session_id: String,
        channel_id: Option<ChannelId>,
    ) {
        if let AudioBackend::Remote(pool) = &self.backend {
            if let Err(e) = pool.on_voice_state(guild_id, session_id, channel_id).await {
                debug!("Voice state not forwarded for guild {}: {}", guild_id, e);
            }
        }
    }

    pub async fn forward_voice_server(&self, guild_id: GuildId, token: String, endpoint: Option<String>) {
        if let AudioBackend::Remote(pool) = &self.backend {
            if let Err(e) = pool.on_voice_server(guild_id, token, endpoint).await {
                debug!("Voice server not forwarded for guild {}: {}", guild_id, e);
            }
        }
    }

    /// Releases backend-wide resources after all players are gone.
    pub fn shutdown(&self) {
        if let AudioBackend::Remote(pool) = &self.backend {
            pool.shutdown();
        }
    }
}
