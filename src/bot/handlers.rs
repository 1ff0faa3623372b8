use anyhow::Result;
use dashmap::{mapref::entry::Entry, DashMap};
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{GuildId, UserId},
    },
    prelude::Context,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::{
    audio::{
        error::PlayerError,
        loader::{AudioLoader, LoadedItem},
        player::{GuildPlayer, SkipDecision},
        queue::RepeatMode,
        revive::ReviveStatus,
        track::TrackContext,
        MAX_VOLUME,
    },
    bot::{
        commands::{parse_timestamp, parse_track_range},
        FredBoatBot,
    },
    ui::embeds::{self, QueueView, QUEUE_PAGE_SIZE},
};

const SKIP_COOLDOWN: Duration = Duration::from_millis(500);

/// What a command answers with.
enum Reply {
    Text(String),
    Embed(CreateEmbed),
}

impl Reply {
    fn into_response(self) -> EditInteractionResponse {
        match self {
            Reply::Text(content) => EditInteractionResponse::new().content(content),
            Reply::Embed(embed) => EditInteractionResponse::new().embed(embed),
        }
    }
}

/// Ignores skips that follow another skip in the same guild too closely.
#[derive(Debug, Default)]
pub struct SkipCooldown {
    last_skip: DashMap<GuildId, Instant>,
}

impl SkipCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the attempt and returns false when it came within the cooldown.
    pub fn try_acquire(&self, guild_id: GuildId) -> bool {
        self.try_acquire_at(guild_id, Instant::now())
    }

    fn try_acquire_at(&self, guild_id: GuildId, now: Instant) -> bool {
        match self.last_skip.entry(guild_id) {
            Entry::Occupied(mut last) => {
                if now.saturating_duration_since(*last.get()) <= SKIP_COOLDOWN {
                    return false;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        true
    }
}

/// Handles slash commands
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &FredBoatBot) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content("❌ Commands only work inside a server")
                        .ephemeral(true),
                ),
            )
            .await?;
        return Ok(());
    };

    info!(
        "📝 /{} used by {} in guild {}",
        command.data.name, command.user.name, guild_id
    );

    command.defer(&ctx.http).await?;

    let name = command.data.name.as_str();
    if !matches!(name, "revive" | "config") {
        bot.registry
            .services()
            .text_channels
            .set_music_channel(guild_id, command.channel_id);
    }

    let user_id = command.user.id;
    let result = match name {
        "play" => handle_play(&command, bot, guild_id, user_id).await,
        "pause" => handle_pause(bot, guild_id).await,
        "resume" => handle_resume(bot, guild_id).await,
        "skip" => handle_skip(&command, bot, guild_id, user_id).await,
        "voteskip" => handle_voteskip(bot, guild_id, user_id).await,
        "stop" => handle_stop(bot, guild_id).await,
        "leave" => handle_leave(bot, guild_id).await,
        "queue" => handle_queue(&command, bot, guild_id).await,
        "nowplaying" => handle_nowplaying(bot, guild_id).await,
        "volume" => handle_volume(&command, bot, guild_id).await,
        "repeat" => handle_repeat(&command, bot, guild_id),
        "shuffle" => handle_shuffle(bot, guild_id),
        "reshuffle" => handle_reshuffle(bot, guild_id),
        "seek" => handle_seek(&command, bot, guild_id).await,
        "config" => handle_config(&command, bot, guild_id).await,
        "revive" => handle_revive(&command, bot, user_id),
        _ => Ok(Reply::Text("❌ Unknown command".to_string())),
    };

    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            if e.is_user_facing() {
                info!("/{} refused in guild {}: {}", name, guild_id, e);
            } else {
                error!("❌ /{} failed in guild {}: {}", name, guild_id, e);
            }
            Reply::Embed(embeds::error_embed("Error", &e.user_message()))
        }
    };

    command.edit_response(&ctx.http, reply.into_response()).await?;
    Ok(())
}

fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn bool_option(command: &CommandInteraction, name: &str) -> Option<bool> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_bool())
}

fn existing_player(bot: &FredBoatBot, guild_id: GuildId) -> Result<Arc<GuildPlayer>, PlayerError> {
    bot.registry
        .get_existing(guild_id)
        .filter(|p| !p.is_destroyed())
        .ok_or(PlayerError::NothingPlaying)
}

// Playback

async fn handle_play(
    command: &CommandInteraction,
    bot: &FredBoatBot,
    guild_id: GuildId,
    user_id: UserId,
) -> Result<Reply, PlayerError> {
    let query = string_option(command, "query").unwrap_or_default();
    let split = bool_option(command, "split").unwrap_or(false);

    bot.limiter.ensure_allowed(guild_id, &bot.registry)?;
    let item = bot.loader.load(query).await?;
    let player = bot.registry.get_or_create(guild_id);

    match item {
        LoadedItem::Track(track) if split => {
            let windows = bot.loader.chapters(&track).await;
            let contexts = AudioLoader::split(&track, user_id, guild_id, windows);
            if contexts.is_empty() {
                warn!("No chapters found for {} in guild {}", track.info.title, guild_id);
                let context = TrackContext::new(track, user_id, guild_id);
                player.queue(context.clone()).await?;
                return Ok(Reply::Embed(embeds::track_added_embed(&context, player.track_count())));
            }
            let count = contexts.len();
            player.queue_all(contexts).await?;
            Ok(Reply::Embed(embeds::playlist_added_embed(&track.info.title, count, true)))
        }
        LoadedItem::Track(track) => {
            let context = TrackContext::new(track, user_id, guild_id);
            player.queue(context.clone()).await?;
            Ok(Reply::Embed(embeds::track_added_embed(&context, player.track_count())))
        }
        LoadedItem::Playlist { name, tracks } => {
            let contexts: Vec<TrackContext> = tracks
                .into_iter()
                .map(|track| TrackContext::new(track, user_id, guild_id))
                .collect();
            let count = contexts.len();
            player.queue_all(contexts).await?;
            Ok(Reply::Embed(embeds::playlist_added_embed(&name, count, false)))
        }
    }
}

async fn handle_pause(bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    if player.playing_track().is_none() {
        return Err(PlayerError::NothingPlaying);
    }
    if player.is_paused() {
        return Ok(Reply::Text("⏸️ The player is already paused.".to_string()));
    }
    player.pause().await?;
    Ok(Reply::Text("⏸️ The player is now paused. Use `/resume` to unpause it.".to_string()))
}

async fn handle_resume(bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    if player.is_queue_empty() && player.playing_track().is_none() {
        return Ok(Reply::Text("The queue is empty.".to_string()));
    }
    if player.is_playing() {
        return Ok(Reply::Text("▶️ The player is not paused.".to_string()));
    }
    player.play().await?;
    Ok(Reply::Text("▶️ The player is now unpaused.".to_string()))
}

async fn handle_skip(
    command: &CommandInteraction,
    bot: &FredBoatBot,
    guild_id: GuildId,
    user_id: UserId,
) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    if player.track_count() == 0 {
        return Ok(Reply::Text("The queue is empty.".to_string()));
    }
    if !bot.skip_cooldown.try_acquire(guild_id) {
        return Ok(Reply::Text("Slow down, skips are rate limited.".to_string()));
    }

    let (start, end) = match string_option(command, "tracks") {
        None => (1, 1),
        Some(arg) => match parse_track_range(arg) {
            Ok(range) => range,
            Err(e) => return Ok(Reply::Text(e.to_string())),
        },
    };
    let track_count = player.track_count();
    if end > track_count {
        return Ok(Reply::Text(format!(
            "Can't remove track number {} when there are only {} tracks.",
            end, track_count
        )));
    }

    let contexts = player.tracks_in_range(start - 1, end);
    let Some(first) = contexts.first() else {
        return Ok(Reply::Text("Couldn't find that track to skip.".to_string()));
    };
    let ids: HashSet<u64> = contexts.iter().map(|c| c.track_id()).collect();
    let success = if start == end {
        format!("⏭️ Skipped track #{}: **{}**", start, crate::audio::escape_and_defuse(first.effective_title()))
    } else {
        format!("⏭️ Skipped tracks #{:02} to #{:02}.", start, end)
    };

    match player.can_member_skip_tracks(user_id, &ids) {
        SkipDecision::Allowed => {
            player.skip_tracks(&ids).await?;
            Ok(Reply::Text(success))
        }
        SkipDecision::Denied(reason) => Ok(Reply::Text(reason.to_string())),
    }
}

async fn handle_voteskip(bot: &FredBoatBot, guild_id: GuildId, user_id: UserId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    let gateway = &bot.registry.services().gateway;
    if gateway.member_voice_channel(guild_id, user_id).is_none() {
        return Err(PlayerError::UserNotInChannel);
    }
    if player.track_count() == 0 {
        return Ok(Reply::Text("The queue is empty.".to_string()));
    }
    if !bot.skip_cooldown.try_acquire(guild_id) {
        return Ok(Reply::Text("Slow down, skips are rate limited.".to_string()));
    }

    let outcome = player.vote_skip(user_id).await?;
    let mut text = if outcome.counted {
        "Your vote has been added!".to_string()
    } else {
        "You already voted to skip this track!".to_string()
    };
    let percent = (outcome.votes as f32 / outcome.listeners.max(1) as f32) * 100.0;
    match outcome.skipped {
        Some(title) => text.push_str(&format!(
            "\n`{:.0}%` have voted to skip. Skipping **{}**.",
            percent,
            crate::audio::escape_and_defuse(&title)
        )),
        None => text.push_str(&format!(
            "\nAt least `50%` must vote to skip, currently `{:.0}%` ({}/{}).",
            percent, outcome.votes, outcome.listeners
        )),
    }
    Ok(Reply::Text(text))
}

async fn handle_stop(bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    let count = player.track_count();
    player.stop().await?;
    let text = match count {
        0 => "The queue was already empty.".to_string(),
        1 => "⏹️ The queue has been emptied, `1` track has been removed.".to_string(),
        n => format!("⏹️ The queue has been emptied, `{}` tracks have been removed.", n),
    };
    Ok(Reply::Text(text))
}

async fn handle_leave(bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    let Some(channel_id) = player.current_voice_channel() else {
        return Ok(Reply::Text("I'm not in a voice channel.".to_string()));
    };
    let channel_name = bot
        .registry
        .services()
        .gateway
        .voice_channel(guild_id, channel_id)
        .map_or_else(|| channel_id.to_string(), |info| info.name);
    if player.is_playing() {
        player.pause().await?;
    }
    player.leave_voice_channel().await;
    Ok(Reply::Text(format!("👋 Left channel **{}**.", crate::audio::escape_and_defuse(&channel_name))))
}

// Queue

async fn handle_queue(command: &CommandInteraction, bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let Some(player) = bot.registry.get_existing(guild_id).filter(|p| !p.is_destroyed()) else {
        return Ok(Reply::Embed(embeds::queue_embed(&QueueView::empty())));
    };
    let requested_page = int_option(command, "page").unwrap_or(1).max(1) as usize;
    Ok(Reply::Embed(embeds::queue_embed(&queue_view(&player, requested_page).await)))
}

/// Page `page` of the combined list where the current track is number 1.
async fn queue_view(player: &GuildPlayer, page: usize) -> QueueView {
    let current = player.playing_track();
    let total = player.track_count();
    let (page, start, end, total_pages) = embeds::page_bounds(total, page, QUEUE_PAGE_SIZE);
    let mut upcoming = player.tracks_in_range(start, end);
    let mut first_number = start + 1;
    if start == 0 && current.is_some() && !upcoming.is_empty() {
        upcoming.remove(0);
        first_number = 2;
    }
    QueueView {
        current,
        upcoming,
        first_number,
        status: player.status(),
        total_tracks: total,
        streams: player.streams_count(),
        remaining: Duration::from_millis(player.total_remaining_ms().await),
        repeat: player.repeat_mode(),
        shuffle: player.is_shuffle(),
        page,
        total_pages,
    }
}

async fn handle_nowplaying(bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    let current = player.playing_track().ok_or(PlayerError::NothingPlaying)?;
    let position = player.position_ms().await;
    Ok(Reply::Embed(embeds::now_playing_embed(&current, position, player.status())))
}

async fn handle_volume(command: &CommandInteraction, bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = bot.registry.get_or_create(guild_id);
    let Some(level) = int_option(command, "level") else {
        return Ok(Reply::Embed(embeds::volume_embed(player.volume())));
    };
    if !bot.config.distribution.volume_supported() {
        return Ok(Reply::Embed(embeds::warning_embed(
            "Volume",
            "Changing the volume is not available on this bot.",
        )));
    }
    let volume = (level as f32 / 100.0).clamp(0.0, MAX_VOLUME);
    player.set_volume(volume).await?;
    Ok(Reply::Embed(embeds::volume_embed(player.volume())))
}

fn parse_repeat_mode(mode: &str) -> Option<RepeatMode> {
    match mode.to_ascii_lowercase().as_str() {
        "off" => Some(RepeatMode::Off),
        "single" | "one" | "track" => Some(RepeatMode::Single),
        "all" | "queue" => Some(RepeatMode::All),
        _ => None,
    }
}

fn handle_repeat(command: &CommandInteraction, bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let Some(mode) = string_option(command, "mode").and_then(parse_repeat_mode) else {
        return Ok(Reply::Text("Repeat mode must be `off`, `single` or `all`.".to_string()));
    };
    let player = bot.registry.get_or_create(guild_id);
    player.set_repeat_mode(mode);
    let text = match mode {
        RepeatMode::Off => "The player is no longer on repeat.",
        RepeatMode::Single => "🔂 The player will now repeat the current track.",
        RepeatMode::All => "🔁 The player will now repeat the queue.",
    };
    Ok(Reply::Text(text.to_string()))
}

fn handle_shuffle(bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = bot.registry.get_or_create(guild_id);
    let shuffle = !player.is_shuffle();
    player.set_shuffle(shuffle);
    let text = if shuffle {
        "🔀 The player is now shuffled."
    } else {
        "➡️ The player is no longer shuffled."
    };
    Ok(Reply::Text(text.to_string()))
}

fn handle_reshuffle(bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    if !player.is_shuffle() {
        return Ok(Reply::Text("Shuffle is off. Use `/shuffle` first.".to_string()));
    }
    player.reshuffle();
    Ok(Reply::Text("🔀 The queue has been reshuffled.".to_string()))
}

async fn handle_seek(command: &CommandInteraction, bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let player = existing_player(bot, guild_id)?;
    let Some(position_ms) = string_option(command, "position").and_then(parse_timestamp) else {
        return Ok(Reply::Text("That is not a valid timestamp. Try `1:30` or `2m10s`.".to_string()));
    };
    let current = player.playing_track().ok_or(PlayerError::NothingPlaying)?;
    if current.is_stream() {
        return Ok(Reply::Text("You can't seek in a live stream.".to_string()));
    }
    player.seek_to(position_ms).await?;
    let target = Duration::from_millis(position_ms).min(current.effective_duration());
    Ok(Reply::Text(format!(
        "⏩ Seeking **{}** to {}.",
        crate::audio::escape_and_defuse(current.effective_title()),
        embeds::format_duration(target)
    )))
}

// Administration

async fn handle_config(command: &CommandInteraction, bot: &FredBoatBot, guild_id: GuildId) -> Result<Reply, PlayerError> {
    let announce = bool_option(command, "announce");
    let auto_resume = bool_option(command, "auto_resume");
    if announce.is_none() && auto_resume.is_none() {
        let summary = embeds::config_summary(&bot.storage.get(guild_id));
        return Ok(Reply::Embed(embeds::info_embed("Configuration", &summary)));
    }

    let can_manage = command
        .member
        .as_ref()
        .and_then(|member| member.permissions)
        .is_some_and(|perms| perms.manage_guild());
    if !can_manage {
        return Ok(Reply::Text(
            "You need the Manage Server permission to change the configuration.".to_string(),
        ));
    }

    let storage_error = |e: anyhow::Error| PlayerError::Storage(e.to_string());
    if let Some(enabled) = announce {
        bot.storage
            .set_track_announce(guild_id, enabled)
            .await
            .map_err(storage_error)?;
    }
    if let Some(enabled) = auto_resume {
        bot.storage
            .set_auto_resume(guild_id, enabled)
            .await
            .map_err(storage_error)?;
    }
    let summary = embeds::config_summary(&bot.storage.get(guild_id));
    Ok(Reply::Embed(embeds::success_embed("Configuration updated", &summary)))
}

fn handle_revive(command: &CommandInteraction, bot: &FredBoatBot, user_id: UserId) -> Result<Reply, PlayerError> {
    if !bot.config.is_bot_admin(user_id.get()) {
        warn!("🚫 {} tried to revive a shard without being a bot admin", user_id);
        return Ok(Reply::Text("This command is restricted to bot admins.".to_string()));
    }
    let shard = int_option(command, "shard").unwrap_or(-1);
    let Ok(shard_id) = u32::try_from(shard) else {
        return Ok(Reply::Text("Shard ids are not negative.".to_string()));
    };
    if shard_id >= bot.config.shard_count {
        return Ok(Reply::Text(format!(
            "There are only {} shards, valid ids are 0 to {}.",
            bot.config.shard_count,
            bot.config.shard_count - 1
        )));
    }
    let Some(reviver) = bot.reviver.get() else {
        return Ok(Reply::Text("Shard control is not available yet, try again shortly.".to_string()));
    };

    let force = bool_option(command, "force").unwrap_or(false);
    let text = match reviver.revive(shard_id, force) {
        ReviveStatus::Started => format!("🔧 Queued shard revive for shard {}.", shard_id),
        ReviveStatus::InProgress { running_for } => format!(
            "Shard {} is already being revived for {}. Use `force` to restart it.",
            shard_id,
            humantime::format_duration(Duration::from_secs(running_for.as_secs()))
        ),
        ReviveStatus::Replaced { running_for } => format!(
            "🔧 Replaced a revive of shard {} that ran for {}.",
            shard_id,
            humantime::format_duration(Duration::from_secs(running_for.as_secs()))
        ),
    };
    Ok(Reply::Text(text))
}
