use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::audio::{
    codec::AudioTrack,
    player::GuildPlayer,
    queue::RepeatMode,
    registry::PlayerRegistry,
    track::{SplitWindow, TrackContext},
};
use crate::config::Distribution;
use crate::gateway::shard_id_for;

/// Process exit codes understood by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Normal,
    Error,
    Restart,
    Update,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Normal => 0,
            ExitCode::Error => 1,
            ExitCode::Restart => 2,
            ExitCode::Update => 20,
        }
    }

    fn shutdown_notice(self) -> &'static str {
        match self {
            ExitCode::Update => {
                "FredBoat is updating. This should only take a minute and will reload the current playlist."
            }
            ExitCode::Restart => {
                "FredBoat is restarting. This should only take a minute and will reload the current playlist."
            }
            _ => "FredBoat is shutting down. Once the bot comes back the current playlist will reload.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedSplit {
    title: String,
    #[serde(rename = "startPos")]
    start_pos: u64,
    #[serde(rename = "endPos")]
    end_pos: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedSource {
    message: String,
    user: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    split: Option<PersistedSplit>,
}

/// On-disk shape of one guild's player, one file per guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedPlayer {
    /// Voice channel id, `"0"` when not connected.
    vc: String,
    /// Text channel id, empty when unknown.
    tc: String,
    #[serde(rename = "isPaused")]
    is_paused: bool,
    volume: String,
    #[serde(rename = "repeatMode")]
    repeat_mode: RepeatMode,
    shuffle: bool,
    /// Position in the first source, present only when a track was loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<u64>,
    sources: Vec<PersistedSource>,
}

fn parse_channel(raw: &str) -> Option<ChannelId> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .map(ChannelId::new)
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub dir: PathBuf,
    pub distribution: Distribution,
    pub shard_limit: u32,
    pub announce_timeout: Duration,
}

/// Saves queues before a shutdown and restores them when their shard is ready.
pub struct MusicPersistence {
    registry: Arc<PlayerRegistry>,
    settings: PersistenceSettings,
}

impl MusicPersistence {
    pub fn new(registry: Arc<PlayerRegistry>, settings: PersistenceSettings) -> Self {
        Self { registry, settings }
    }

    /// Persists every player unless running the music distribution, then tears
    /// the players and the backend down.
    pub async fn pre_shutdown(&self, exit_code: ExitCode) {
        if self.settings.distribution != Distribution::Music {
            self.persist(exit_code).await;
        }
        self.registry.shutdown().await;
        self.registry.services().facade.shutdown();
    }

    async fn persist(&self, exit_code: ExitCode) {
        if let Err(e) = fs::create_dir_all(&self.settings.dir).await {
            error!(
                "❌ Could not create music persistence directory {}: {}",
                self.settings.dir.display(),
                e
            );
            return;
        }

        let started = Instant::now();
        let players = self.registry.players();
        info!("💾 Saving {} guild players", players.len());
        let mut saved = 0;
        for player in &players {
            match self.persist_player(player, exit_code).await {
                Ok(()) => saved += 1,
                Err(e) => error!(
                    "❌ Error saving player for guild {}: {:#}",
                    player.guild_id(),
                    e
                ),
            }
        }
        info!(
            "💾 Saved {}/{} guild players in {:?}",
            saved,
            players.len(),
            started.elapsed()
        );
    }

    async fn persist_player(&self, player: &GuildPlayer, exit_code: ExitCode) -> Result<()> {
        let gateway = &self.registry.services().gateway;
        let text_channel = player.active_text_channel();

        if let Some(channel_id) = text_channel.filter(|_| player.is_playing()) {
            let notice = gateway.send_message(channel_id, exit_code.shutdown_notice());
            match tokio::time::timeout(self.settings.announce_timeout, notice).await {
                Ok(Err(e)) => debug!("Shutdown notice failed in guild {}: {}", player.guild_id(), e),
                Err(_) => debug!("Shutdown notice timed out in guild {}", player.guild_id()),
                Ok(Ok(())) => {}
            }
        }

        let position = match player.playing_track() {
            Some(_) => Some(player.position_ms().await),
            None => None,
        };
        let state = PersistedPlayer {
            vc: player
                .current_voice_channel()
                .map_or_else(|| "0".to_string(), |c| c.to_string()),
            tc: text_channel.map(|c| c.to_string()).unwrap_or_default(),
            is_paused: player.is_paused(),
            volume: player.volume().to_string(),
            repeat_mode: player.repeat_mode(),
            shuffle: player.is_shuffle(),
            position,
            sources: player
                .remaining_tracks()
                .iter()
                .map(|ctx| PersistedSource {
                    message: ctx.track().encoded.clone(),
                    user: ctx.user_id().get(),
                    split: ctx.split_window().map(|w| PersistedSplit {
                        title: w.title.clone(),
                        start_pos: w.start_ms,
                        end_pos: w.start_ms + w.length_ms(),
                    }),
                })
                .collect(),
        };

        let json = serde_json::to_string(&state)?;
        let path = self.file_for(player.guild_id());
        if let Err(e) = fs::write(&path, json).await {
            if let Some(channel_id) = text_channel {
                let notice = format!("Failed to save the current queue: {}", e);
                let _ = gateway.send_message(channel_id, &notice).await;
            }
            return Err(e).with_context(|| format!("writing {}", path.display()));
        }
        debug!(
            "💾 Saved {} tracks for guild {}",
            state.sources.len(),
            player.guild_id()
        );
        Ok(())
    }

    fn file_for(&self, guild_id: GuildId) -> PathBuf {
        self.settings.dir.join(guild_id.to_string())
    }

    /// Large deployments and the music distribution never reload.
    pub fn should_reload(&self, shard_count: u32) -> bool {
        shard_count <= self.settings.shard_limit && self.settings.distribution != Distribution::Music
    }

    /// Restores every saved guild that lives on `shard_id`. Returns how many were restored.
    pub async fn reload_for_shard(&self, shard_id: u32, shard_count: u32) -> usize {
        if !self.should_reload(shard_count) {
            debug!("Music persistence reload disabled for this deployment");
            return 0;
        }

        let mut entries = match fs::read_dir(&self.settings.dir).await {
            Ok(entries) => entries,
            Err(_) => {
                info!("No music persistence directory found");
                return 0;
            }
        };
        info!("📂 Reloading playlists for shard {}", shard_id);

        let gateway = Arc::clone(&self.registry.services().gateway);
        let mut restored = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Could not list music persistence directory: {}", e);
                    break;
                }
            };
            let path = entry.path();
            let Some(guild_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
                .filter(|id| *id != 0)
                .map(GuildId::new)
            else {
                continue;
            };
            if shard_id_for(guild_id, shard_count) != shard_id || !gateway.has_guild(guild_id) {
                continue;
            }

            match self.reload_guild(guild_id, &path).await {
                Ok(count) => {
                    restored += 1;
                    info!("📂 Restored {} tracks in guild {}", count, guild_id);
                }
                Err(e) => error!("❌ Error loading persistence file for guild {}: {:#}", guild_id, e),
            }
            match fs::remove_file(&path).await {
                Ok(()) => debug!("Deleted persistence file {}", path.display()),
                Err(e) => warn!("Failed to delete persistence file {}: {}", path.display(), e),
            }
        }
        restored
    }

    async fn reload_guild(&self, guild_id: GuildId, path: &Path) -> Result<usize> {
        let raw = fs::read_to_string(path).await?;
        let data: PersistedPlayer = serde_json::from_str(&raw)?;
        let services = self.registry.services();
        let gateway = &services.gateway;

        let player = self.registry.get_or_create(guild_id);
        let text_channel = parse_channel(&data.tc);
        if let Some(channel_id) = text_channel {
            services.text_channels.set_music_channel(guild_id, channel_id);
        }
        if self.settings.distribution.volume_supported() {
            match data.volume.parse::<f32>() {
                Ok(volume) => player.set_volume(volume).await?,
                Err(_) => warn!("Ignoring bad saved volume {:?} in guild {}", data.volume, guild_id),
            }
        }
        player.set_repeat_mode(data.repeat_mode);
        player.set_shuffle(data.shuffle);

        let fallback_user = gateway.current_user_id();
        let mut contexts = Vec::with_capacity(data.sources.len());
        for source in &data.sources {
            let track = match AudioTrack::decode(&source.message) {
                Ok(track) => track,
                Err(e) => {
                    warn!("Skipping undecodable saved track in guild {}: {}", guild_id, e);
                    continue;
                }
            };
            let saved_user = UserId::new(source.user.max(1));
            let user_id = if gateway.member_exists(guild_id, saved_user) {
                saved_user
            } else {
                fallback_user.unwrap_or(saved_user)
            };

            let context = match &source.split {
                Some(split) => TrackContext::split(
                    track,
                    user_id,
                    guild_id,
                    SplitWindow::new(split.title.clone(), split.start_pos, split.end_pos),
                ),
                None => TrackContext::new(track, user_id, guild_id),
            };
            let context = match data.position {
                Some(position) if contexts.is_empty() => context.with_resume_offset(position),
                _ => context,
            };
            contexts.push(context);
        }
        let count = contexts.len();
        player.load_all(contexts).await;

        if !data.is_paused {
            if let Some(voice_channel) = parse_channel(&data.vc) {
                match player.join_channel(voice_channel).await {
                    Ok(()) => {
                        if let Err(e) = player.play().await {
                            debug!("Restored player in guild {} did not start: {}", guild_id, e);
                        }
                    }
                    Err(e) => debug!("Could not rejoin voice in guild {}: {}", guild_id, e),
                }
            }
            if let Some(channel_id) = text_channel {
                let notice = format!("Reloading playlist. `{}` tracks found.", data.sources.len());
                if let Err(e) = gateway.send_message(channel_id, &notice).await {
                    debug!("Reload notice failed in guild {}: {}", guild_id, e);
                }
            }
        }
        Ok(count)
    }
}
