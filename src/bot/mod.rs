//! # Bot Module
//!
//! Discord side of FredBoat: slash command registration and dispatch, and the
//! gateway events the audio core reacts to.
//!
//! ## Architecture
//!
//! [`FredBoatBot`] implements serenity's [`EventHandler`]. It owns no playback
//! state itself; everything goes through the [`PlayerRegistry`]:
//!
//! - `ready` starts the audio backend, registers commands and restores the
//!   shard's saved queues and revived voice channels
//! - `voice_state_update` drives auto pause / resume and feeds relay nodes
//! - `guild_delete` destroys the guild's player
//! - `interaction_create` runs [`handlers::handle_command`]

use anyhow::Result;
use serenity::{
    all::{
        Context, EventHandler, GuildId, Interaction, Ready, UnavailableGuild, VoiceServerUpdateEvent,
        VoiceState,
    },
    async_trait,
    model::guild::Guild,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::{
        loader::AudioLoader,
        persistence::MusicPersistence,
        presence::VoicePresence,
        registry::{PlayerLimiter, PlayerRegistry},
        revive::{ShardReviveHandler, ShardReviver},
    },
    config::Config,
    executor::TaskExecutor,
    storage::JsonStorage,
};
use handlers::SkipCooldown;

/// How long a freshly connected shard may take to stream its guilds into the cache.
const GUILD_CACHE_WAIT: Duration = Duration::from_secs(30);
const GUILD_CACHE_POLL: Duration = Duration::from_millis(500);

/// Main Discord event handler.
///
/// Built before the serenity client exists; the shard reviver is attached
/// afterwards because it needs the client's shard manager.
pub struct FredBoatBot {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: Arc<PlayerRegistry>,
    pub(crate) storage: Arc<JsonStorage>,
    pub(crate) loader: AudioLoader,
    pub(crate) limiter: PlayerLimiter,
    pub(crate) persistence: Arc<MusicPersistence>,
    pub(crate) revive_handler: Arc<ShardReviveHandler>,
    pub(crate) reviver: OnceLock<Arc<ShardReviver>>,
    pub(crate) presence: VoicePresence,
    pub(crate) executor: TaskExecutor,
    pub(crate) skip_cooldown: SkipCooldown,
    backend_started: AtomicBool,
    commands_registered: AtomicBool,
}

impl FredBoatBot {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<PlayerRegistry>,
        storage: Arc<JsonStorage>,
        persistence: Arc<MusicPersistence>,
        revive_handler: Arc<ShardReviveHandler>,
        executor: TaskExecutor,
    ) -> Self {
        let facade = Arc::clone(&registry.services().facade);
        Self {
            limiter: PlayerLimiter::new(config.player_limit),
            loader: AudioLoader::new(facade),
            presence: VoicePresence::new(Arc::clone(&registry)),
            config,
            registry,
            storage,
            persistence,
            revive_handler,
            reviver: OnceLock::new(),
            executor,
            skip_cooldown: SkipCooldown::new(),
            backend_started: AtomicBool::new(false),
            commands_registered: AtomicBool::new(false),
        }
    }

    /// Attaches the shard reviver once the client's shard manager exists.
    pub fn attach_reviver(&self, reviver: Arc<ShardReviver>) {
        if self.reviver.set(reviver).is_err() {
            warn!("Shard reviver was already attached");
        }
    }

    /// Registers slash commands with Discord.
    ///
    /// Commands are registered per guild when `GUILD_ID` is set (instant
    /// propagation, meant for development) and globally otherwise.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registering guild commands: {:?}", e);
                    anyhow::anyhow!("Could not register guild commands. Check the bot's 'applications.commands' scope.")
                })?;
                info!("✅ Guild commands registered for {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registering global commands: {:?}", e);
                    anyhow::anyhow!("Could not register global commands. Check the bot's 'applications.commands' scope.")
                })?;
                info!("✅ Global commands registered");
            }
        }
        Ok(())
    }

    /// Restores saved queues and revived channels of a shard once its guilds are cached.
    fn schedule_shard_restore(&self, shard_id: u32, guilds: Vec<GuildId>) {
        let persistence = Arc::clone(&self.persistence);
        let revive_handler = Arc::clone(&self.revive_handler);
        let gateway = Arc::clone(&self.registry.services().gateway);
        let shard_count = self.config.shard_count;
        let cancel = self.executor.cancelled();

        self.executor.spawn("shard-restore", async move {
            let deadline = tokio::time::Instant::now() + GUILD_CACHE_WAIT;
            while guilds.iter().any(|g| !gateway.has_guild(*g)) {
                if tokio::time::Instant::now() >= deadline {
                    warn!("⏱️ Shard {} guilds still not cached, restoring what is there", shard_id);
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(GUILD_CACHE_POLL) => {}
                }
            }

            let restored = persistence.reload_for_shard(shard_id, shard_count).await;
            let rejoined = revive_handler.on_shard_ready(shard_id).await;
            if restored > 0 || rejoined > 0 {
                info!(
                    "🔁 Shard {} ready: {} queues restored, {} channels rejoined",
                    shard_id, restored, rejoined
                );
            }
        });
    }
}

#[async_trait]
impl EventHandler for FredBoatBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        let shard_id = ctx.shard_id.0;
        info!(
            "🤖 {} is online on shard {} with {} guilds",
            ready.user.name,
            shard_id,
            ready.guilds.len()
        );

        if !self.backend_started.swap(true, Ordering::SeqCst) {
            self.registry
                .services()
                .facade
                .start(ready.user.id, &self.executor);
        }

        if !self.commands_registered.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.register_commands(&ctx).await {
                error!("Error registering commands: {:?}", e);
                self.commands_registered.store(false, Ordering::SeqCst);
            }
        }

        let guilds = ready.guilds.iter().map(|g| g.id).collect();
        self.schedule_shard_restore(shard_id, guilds);
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error handling command: {:?}", e);
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let me = ctx.cache.current_user().id;

        if new.user_id == me {
            self.registry
                .services()
                .facade
                .forward_voice_state(guild_id, new.session_id.clone(), new.channel_id)
                .await;
        }

        let left = old.and_then(|o| o.channel_id);
        let joined = new.channel_id;
        if left == joined {
            return;
        }
        let is_bot = new
            .member
            .as_ref()
            .map(|m| m.user.bot)
            .or_else(|| ctx.cache.user(new.user_id).map(|u| u.bot))
            .unwrap_or(false);

        debug!(
            "Voice move in guild {}: {} {:?} -> {:?}",
            guild_id, new.user_id, left, joined
        );
        self.presence
            .on_voice_move(guild_id, new.user_id, is_bot, left, joined)
            .await;
    }

    async fn voice_server_update(&self, _ctx: Context, event: VoiceServerUpdateEvent) {
        let Some(guild_id) = event.guild_id else {
            return;
        };
        self.registry
            .services()
            .facade
            .forward_voice_server(guild_id, event.token, event.endpoint)
            .await;
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // Outages mark the guild unavailable; only a real removal drops the player.
        if incomplete.unavailable {
            return;
        }
        let guild_id = incomplete.id;
        if self.registry.destroy_player(guild_id).await {
            info!("🗑️ Left guild {}, its player was destroyed", guild_id);
        }
        self.registry.services().text_channels.forget(guild_id);
    }
}
