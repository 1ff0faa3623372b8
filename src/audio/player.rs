use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serenity::model::{
    id::{ChannelId, GuildId, UserId},
    Permissions,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::audio::{
    backend::{PlaybackHandle, PlayerEvent, PlayerEventListener, TrackEndReason},
    connection::AudioConnectionFacade,
    error::PlayerError,
    escape_and_defuse,
    queue::{RepeatMode, TrackProvider},
    text_channel::MusicTextChannelProvider,
    track::TrackContext,
    MAX_VOLUME,
};
use crate::gateway::DiscordGateway;
use crate::storage::GuildConfigService;

/// Share of the listeners that must vote before a track is skipped.
const MIN_SKIP_RATIO: f32 = 0.5;

/// Shared collaborators every guild player talks to.
#[derive(Clone)]
pub struct PlayerServices {
    pub facade: Arc<AudioConnectionFacade>,
    pub gateway: Arc<dyn DiscordGateway>,
    pub guild_config: Arc<dyn GuildConfigService>,
    pub text_channels: Arc<MusicTextChannelProvider>,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    /// Nothing loaded and nothing queued.
    Stopped,
    /// Nothing loaded but tracks are waiting.
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDenial {
    CurrentTrackNotOwned,
    QueuedTracksNotOwned,
}

impl fmt::Display for SkipDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipDenial::CurrentTrackNotOwned => {
                write!(f, "You can't skip the current track because it was added by someone else.")
            }
            SkipDenial::QueuedTracksNotOwned => {
                write!(f, "You can only skip tracks you added yourself.")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Allowed,
    Denied(SkipDenial),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteSkipOutcome {
    /// False when the user had already voted for this track.
    pub counted: bool,
    pub votes: usize,
    pub listeners: usize,
    /// Title of the skipped track once the vote passed.
    pub skipped: Option<String>,
}

#[derive(Debug)]
struct PlayerState {
    current: Option<TrackContext>,
    paused: bool,
    volume: f32,
    destroyed: bool,
}

/// Playback state and queue of a single guild.
///
/// Mutating operations are serialized on `op_lock`; read-only queries only take
/// the short state lock and may run concurrently with them. Every mutating call
/// after [`GuildPlayer::destroy`] panics.
pub struct GuildPlayer {
    guild_id: GuildId,
    provider: TrackProvider,
    handle: Arc<dyn PlaybackHandle>,
    services: PlayerServices,
    state: RwLock<PlayerState>,
    op_lock: tokio::sync::Mutex<()>,
    skip_votes: Mutex<HashSet<UserId>>,
}

impl GuildPlayer {
    pub fn new(guild_id: GuildId, services: PlayerServices, volume: f32) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<GuildPlayer>| {
            let listener: Weak<dyn PlayerEventListener> = weak.clone();
            let handle = services.facade.create_player(guild_id, listener);
            debug!("🎛️ Created player for guild {}", guild_id);
            Self {
                guild_id,
                provider: TrackProvider::new(),
                handle,
                services,
                state: RwLock::new(PlayerState {
                    current: None,
                    paused: false,
                    volume: volume.clamp(0.0, MAX_VOLUME),
                    destroyed: false,
                }),
                op_lock: tokio::sync::Mutex::new(()),
                skip_votes: Mutex::new(HashSet::new()),
            }
        })
    }

    fn ensure_alive(&self) {
        assert!(
            !self.state.read().destroyed,
            "player for guild {} used after it was destroyed",
            self.guild_id
        );
    }

    fn check_queue_room(&self, incoming: usize) -> Result<(), PlayerError> {
        let max = self.services.max_queue_size;
        if self.provider.size() + incoming > max {
            return Err(PlayerError::QueueFull(max));
        }
        Ok(())
    }

    // ---- queueing ----

    /// Queues one track, joins the requester's channel and starts playback if idle.
    pub async fn queue(&self, context: TrackContext) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.check_queue_room(1)?;

        let requester = context.user_id();
        if self.services.gateway.member_exists(self.guild_id, requester) {
            self.join_member_channel_locked(requester).await?;
        }
        info!(
            "➕ Queued {} in guild {} (requested by {})",
            context.effective_title(),
            self.guild_id,
            requester
        );
        self.provider.add(context);
        self.play_locked().await
    }

    /// Queues a batch in order. The first requester decides which channel is joined.
    pub async fn queue_all(&self, contexts: Vec<TrackContext>) -> Result<(), PlayerError> {
        let Some(first) = contexts.first() else {
            return Ok(());
        };
        let requester = first.user_id();

        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.check_queue_room(contexts.len())?;

        if self.services.gateway.member_exists(self.guild_id, requester) {
            self.join_member_channel_locked(requester).await?;
        }
        info!("➕ Queued {} tracks in guild {}", contexts.len(), self.guild_id);
        self.provider.add_all(contexts);
        self.play_locked().await
    }

    /// Appends tracks without joining voice or starting playback.
    pub async fn load_all(&self, contexts: Vec<TrackContext>) {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        debug!("📥 Loaded {} tracks into guild {}", contexts.len(), self.guild_id);
        self.provider.add_all(contexts);
    }

    // ---- voice ----

    pub async fn join_channel(&self, channel_id: ChannelId) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.join_channel_locked(channel_id).await
    }

    pub async fn join_member_channel(&self, user_id: UserId) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.join_member_channel_locked(user_id).await
    }

    async fn join_member_channel_locked(&self, user_id: UserId) -> Result<(), PlayerError> {
        let channel_id = self
            .services
            .gateway
            .member_voice_channel(self.guild_id, user_id)
            .ok_or(PlayerError::UserNotInChannel)?;
        self.join_channel_locked(channel_id).await
    }

    async fn join_channel_locked(&self, channel_id: ChannelId) -> Result<(), PlayerError> {
        let gateway = &self.services.gateway;
        let facade = &self.services.facade;

        if gateway.self_voice_channel(self.guild_id) == Some(channel_id)
            && facade.is_connected(self.guild_id).await
        {
            return Ok(());
        }

        let channel = gateway
            .voice_channel(self.guild_id, channel_id)
            .ok_or(PlayerError::ChannelNotFound)?;
        let perms = gateway.self_permissions_in(self.guild_id, channel_id);
        let already_inside = gateway
            .current_user_id()
            .is_some_and(|me| channel.members.contains(&me));

        if !perms.contains(Permissions::CONNECT) && !already_inside {
            return Err(PlayerError::ConnectDenied);
        }
        if !perms.contains(Permissions::SPEAK) {
            return Err(PlayerError::SpeakDenied);
        }
        if channel.is_full() && !already_inside && !perms.contains(Permissions::MOVE_MEMBERS) {
            return Err(PlayerError::ChannelFull);
        }

        facade.open_connection(self.guild_id, channel_id).await?;
        info!("🔗 Joined {} in guild {}", channel.name, self.guild_id);
        Ok(())
    }

    /// Leaves voice without touching the queue.
    pub async fn leave_voice_channel(&self) {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.services.facade.close_connection(self.guild_id).await;
    }

    // ---- playback control ----

    /// Unpauses, or starts the next queued track when nothing is loaded.
    pub async fn play(&self) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.play_locked().await
    }

    async fn play_locked(&self) -> Result<(), PlayerError> {
        let (paused, has_current) = {
            let state = self.state.read();
            (state.paused, state.current.is_some())
        };
        if paused {
            self.state.write().paused = false;
            if has_current {
                self.handle.set_paused(false).await?;
            }
        }
        if !has_current {
            self.play_next_locked().await?;
        }
        Ok(())
    }

    async fn play_next_locked(&self) -> Result<(), PlayerError> {
        let Some(next) = self.provider.next() else {
            let had_current = self.state.write().current.take().is_some();
            if had_current {
                self.handle.stop().await?;
            }
            debug!("📭 Queue exhausted in guild {}", self.guild_id);
            return Ok(());
        };

        let (volume, paused) = {
            let mut state = self.state.write();
            state.current = Some(next.clone());
            (state.volume, state.paused)
        };
        let started = self
            .handle
            .play(
                next.track(),
                next.start_position_ms(),
                next.end_position_ms(),
                volume,
                paused,
            )
            .await;
        if let Err(e) = started {
            self.state.write().current = None;
            return Err(e);
        }
        info!("🎵 Playing {} in guild {}", next.effective_title(), self.guild_id);
        Ok(())
    }

    /// Pauses the current track. Pausing while idle makes the next track start paused.
    pub async fn pause(&self) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        let has_current = {
            let mut state = self.state.write();
            state.paused = true;
            state.current.is_some()
        };
        if has_current {
            self.handle.set_paused(true).await?;
        }
        info!("⏸️ Paused guild {}", self.guild_id);
        Ok(())
    }

    /// Unpauses the current track; does nothing when no track is loaded.
    pub async fn resume(&self) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        let resumed = {
            let mut state = self.state.write();
            if state.current.is_some() && state.paused {
                state.paused = false;
                true
            } else {
                false
            }
        };
        if resumed {
            self.handle.set_paused(false).await?;
            info!("▶️ Resumed guild {}", self.guild_id);
        }
        Ok(())
    }

    /// Clears the queue and ends the current track.
    pub async fn stop(&self) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.provider.clear();
        self.skip_votes.lock().clear();
        let had_current = self.state.write().current.take().is_some();
        if had_current {
            self.handle.stop().await?;
        }
        info!("⏹️ Stopped guild {}", self.guild_id);
        Ok(())
    }

    pub async fn skip(&self) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        self.skip_locked().await
    }

    async fn skip_locked(&self) -> Result<(), PlayerError> {
        self.provider.skipped();
        if let Some(current) = self.playing_track() {
            info!("⏭️ Skipping {} in guild {}", current.effective_title(), self.guild_id);
        }
        self.play_next_locked().await
    }

    /// Removes the given tracks; the current one is skipped last so playback moves on once.
    pub async fn skip_tracks(&self, track_ids: &HashSet<u64>) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        let removed = self.provider.remove_all_by_id(track_ids);
        debug!("🗑️ Removed {} queued tracks in guild {}", removed, self.guild_id);

        let skip_current = self
            .playing_track()
            .is_some_and(|current| track_ids.contains(&current.track_id()));
        if skip_current {
            self.skip_locked().await?;
        }
        Ok(())
    }

    /// Seeks within the current track; positions past the end are clamped.
    /// Does nothing when no track is loaded.
    pub async fn seek_to(&self, position_ms: u64) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        let Some(current) = self.playing_track() else {
            debug!("Ignoring seek in idle guild {}", self.guild_id);
            return Ok(());
        };
        if current.is_stream() {
            debug!("Ignoring seek on a stream in guild {}", self.guild_id);
            return Ok(());
        }
        self.handle.seek(current.absolute_position_ms(position_ms)).await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        let volume = volume.clamp(0.0, MAX_VOLUME);
        self.state.write().volume = volume;
        self.handle.set_volume(volume).await?;
        info!("🔊 Volume set to {:.0}% in guild {}", volume * 100.0, self.guild_id);
        Ok(())
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) {
        self.ensure_alive();
        self.provider.set_repeat_mode(mode);
    }

    pub fn set_shuffle(&self, shuffle: bool) {
        self.ensure_alive();
        self.provider.set_shuffle(shuffle);
    }

    pub fn reshuffle(&self) {
        self.ensure_alive();
        self.provider.reshuffle();
    }

    // ---- skip authorization ----

    /// Moderators may skip anything; everyone else only tracks they queued.
    pub fn can_member_skip_tracks(&self, user_id: UserId, track_ids: &HashSet<u64>) -> SkipDecision {
        if self.services.gateway.is_moderator(self.guild_id, user_id) {
            return SkipDecision::Allowed;
        }
        if let Some(current) = self.playing_track() {
            if track_ids.contains(&current.track_id()) && current.user_id() != user_id {
                return SkipDecision::Denied(SkipDenial::CurrentTrackNotOwned);
            }
        }
        if !self.provider.is_user_track_owner(user_id, track_ids) {
            return SkipDecision::Denied(SkipDenial::QueuedTracksNotOwned);
        }
        SkipDecision::Allowed
    }

    /// Registers a skip vote; skips once at least half the listeners agree.
    pub async fn vote_skip(&self, user_id: UserId) -> Result<VoteSkipOutcome, PlayerError> {
        let _guard = self.op_lock.lock().await;
        self.ensure_alive();
        let current = self.playing_track().ok_or(PlayerError::NothingPlaying)?;
        let listeners = self.human_listeners();
        if !listeners.contains(&user_id) {
            return Err(PlayerError::NotInSameChannel);
        }

        let (counted, votes) = {
            let mut ballots = self.skip_votes.lock();
            let counted = ballots.insert(user_id);
            let votes = ballots.iter().filter(|u| listeners.contains(u)).count();
            (counted, votes)
        };
        let ratio = votes as f32 / listeners.len() as f32;
        debug!(
            "🗳️ Skip vote in guild {}: {}/{} listeners",
            self.guild_id,
            votes,
            listeners.len()
        );

        let mut skipped = None;
        if ratio >= MIN_SKIP_RATIO {
            self.skip_locked().await?;
            skipped = Some(current.effective_title().to_string());
        }
        Ok(VoteSkipOutcome {
            counted,
            votes,
            listeners: listeners.len(),
            skipped,
        })
    }

    // ---- queries ----

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn services(&self) -> &PlayerServices {
        &self.services
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.read().destroyed
    }

    pub fn playing_track(&self) -> Option<TrackContext> {
        self.state.read().current.clone()
    }

    pub fn is_playing(&self) -> bool {
        let state = self.state.read();
        state.current.is_some() && !state.paused
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    pub fn status(&self) -> PlayerStatus {
        let state = self.state.read();
        match (&state.current, state.paused) {
            (Some(_), true) => PlayerStatus::Paused,
            (Some(_), false) => PlayerStatus::Playing,
            (None, _) if self.provider.is_empty() => PlayerStatus::Stopped,
            (None, _) => PlayerStatus::Idle,
        }
    }

    pub fn volume(&self) -> f32 {
        self.state.read().volume
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.provider.repeat_mode()
    }

    pub fn is_shuffle(&self) -> bool {
        self.provider.is_shuffle()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.playing_track().is_none() && self.provider.is_empty()
    }

    /// Queued tracks plus the current one.
    pub fn track_count(&self) -> usize {
        self.provider.size() + usize::from(self.playing_track().is_some())
    }

    /// Slice of the combined list where index 0 is the current track when one is loaded.
    pub fn tracks_in_range(&self, start: usize, end: usize) -> Vec<TrackContext> {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let mut result = Vec::new();
        match self.playing_track() {
            Some(current) if start == 0 => {
                if end > 0 {
                    result.push(current);
                }
                result.extend(self.provider.tracks_in_range(0, end.saturating_sub(1)));
            }
            Some(_) => {
                result.extend(self.provider.tracks_in_range(start - 1, end.saturating_sub(1)));
            }
            None => result.extend(self.provider.tracks_in_range(start, end)),
        }
        result
    }

    /// Current track followed by the queue, in play order.
    pub fn remaining_tracks(&self) -> Vec<TrackContext> {
        let mut tracks: Vec<TrackContext> = self.playing_track().into_iter().collect();
        tracks.extend(self.provider.as_list());
        tracks
    }

    pub fn streams_count(&self) -> usize {
        let current_stream = self.playing_track().is_some_and(|c| c.is_stream());
        self.provider.streams_count() + usize::from(current_stream)
    }

    /// Position inside the current track's effective window.
    pub async fn position_ms(&self) -> u64 {
        match self.playing_track() {
            Some(current) => current.relative_position_ms(self.handle.position_ms().await),
            None => 0,
        }
    }

    /// Playtime left for the current track and the queue, streams excluded.
    pub async fn total_remaining_ms(&self) -> u64 {
        let current = match self.playing_track() {
            Some(current) if !current.is_stream() => {
                let position = current.relative_position_ms(self.handle.position_ms().await);
                current.effective_duration_ms().saturating_sub(position)
            }
            _ => 0,
        };
        current + self.provider.duration_millis()
    }

    pub fn current_voice_channel(&self) -> Option<ChannelId> {
        self.services.gateway.self_voice_channel(self.guild_id)
    }

    pub fn active_text_channel(&self) -> Option<ChannelId> {
        self.services
            .text_channels
            .music_channel(self.guild_id, self.services.gateway.as_ref())
    }

    /// Non-bot members sharing the bot's voice channel.
    pub fn human_listeners(&self) -> Vec<UserId> {
        let gateway = &self.services.gateway;
        gateway
            .self_voice_channel(self.guild_id)
            .and_then(|channel| gateway.voice_channel(self.guild_id, channel))
            .map(|info| info.humans)
            .unwrap_or_default()
    }

    // ---- lifecycle ----

    /// Terminal: clears the queue, frees the backend handle and leaves voice.
    pub async fn destroy(&self) {
        let _guard = self.op_lock.lock().await;
        if self.state.read().destroyed {
            return;
        }
        self.provider.clear();
        self.skip_votes.lock().clear();
        self.state.write().current = None;
        self.handle.destroy().await;
        self.services.facade.close_connection(self.guild_id).await;
        self.state.write().destroyed = true;
        info!("💥 Destroyed player for guild {}", self.guild_id);
    }

    // ---- backend callbacks ----

    async fn on_track_start(&self) {
        self.skip_votes.lock().clear();
        let (current, paused) = {
            let state = self.state.read();
            (state.current.clone(), state.paused)
        };
        let Some(current) = current else {
            return;
        };
        if paused
            || self.provider.repeat_mode() == RepeatMode::Single
            || !self.services.guild_config.track_announce(self.guild_id)
        {
            return;
        }
        let Some(channel_id) = self.active_text_channel() else {
            return;
        };
        let message = format!("Now playing **{}**.", escape_and_defuse(current.effective_title()));
        if let Err(e) = self.services.gateway.send_message(channel_id, &message).await {
            warn!("Could not announce track in guild {}: {}", self.guild_id, e);
        }
    }

    async fn on_track_end(&self, reason: TrackEndReason) {
        let _guard = self.op_lock.lock().await;
        if self.state.read().destroyed {
            return;
        }
        if reason == TrackEndReason::Cleanup {
            self.state.write().current = None;
            return;
        }
        if !reason.may_start_next() {
            return;
        }
        if let Err(e) = self.play_next_locked().await {
            self.handle_error(&e).await;
        }
    }

    async fn on_track_exception(&self, message: &str) {
        warn!("🚨 Track error in guild {}: {}", self.guild_id, message);
        self.post(&format!("Something went wrong!\n{}", message)).await;
    }

    /// Logs infrastructure failures and tells the guild something broke.
    pub async fn handle_error(&self, error: &PlayerError) {
        if !error.is_user_facing() {
            error!("❌ Player error in guild {}: {}", self.guild_id, error);
        }
        self.post(&error.user_message()).await;
    }

    async fn post(&self, content: &str) {
        let Some(channel_id) = self.active_text_channel() else {
            return;
        };
        if let Err(e) = self.services.gateway.send_message(channel_id, content).await {
            warn!("Could not post to guild {}: {}", self.guild_id, e);
        }
    }
}

#[async_trait]
impl PlayerEventListener for GuildPlayer {
    async fn on_player_event(&self, event: PlayerEvent) {
        if self.is_destroyed() {
            return;
        }
        match event {
            PlayerEvent::TrackStart => self.on_track_start().await,
            PlayerEvent::TrackEnd(reason) => self.on_track_end(reason).await,
            PlayerEvent::TrackException(message) => self.on_track_exception(&message).await,
        }
    }
}

impl fmt::Debug for GuildPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuildPlayer")
            .field("guild_id", &self.guild_id)
            .field("status", &self.status())
            .field("queued", &self.provider.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{context, stream_context, HandleCall, Harness, BOT_ID, GUILD};
    use pretty_assertions::assert_eq;

    fn ids(contexts: &[&TrackContext]) -> HashSet<u64> {
        contexts.iter().map(|c| c.track_id()).collect()
    }

    #[tokio::test]
    async fn test_queue_joins_requester_and_plays() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();

        player.queue(context("First", 1)).await.unwrap();
        player.queue(context("Second", 1)).await.unwrap();

        assert_eq!(harness.backend.connects(), vec![(GUILD, ChannelId::new(100))]);
        assert_eq!(harness.played_titles(), vec!["First".to_string()]);
        assert_eq!(player.status(), PlayerStatus::Playing);
        assert_eq!(player.track_count(), 2);
        assert_eq!(player.current_voice_channel(), Some(ChannelId::new(100)));
    }

    #[tokio::test]
    async fn test_queue_rejects_requester_outside_voice() {
        let harness = Harness::new();
        harness.discord.add_member(GUILD, UserId::new(1));
        let player = harness.player();

        let err = player.queue(context("First", 1)).await.unwrap_err();
        assert!(matches!(err, PlayerError::UserNotInChannel));
        assert!(player.is_queue_empty());
    }

    #[tokio::test]
    async fn test_join_checks_permissions() {
        let harness = Harness::new();
        harness.discord.add_voice_channel(GUILD, ChannelId::new(7), 0, Permissions::CONNECT);
        let player = harness.player();

        let err = player.join_channel(ChannelId::new(7)).await.unwrap_err();
        assert!(matches!(err, PlayerError::SpeakDenied));

        let err = player.join_channel(ChannelId::new(8)).await.unwrap_err();
        assert!(matches!(err, PlayerError::ChannelNotFound));
        assert!(harness.backend.connects().is_empty());
    }

    #[tokio::test]
    async fn test_join_full_channel_needs_move_members() {
        let harness = Harness::new();
        let channel = ChannelId::new(9);
        harness
            .discord
            .add_voice_channel(GUILD, channel, 1, Permissions::CONNECT | Permissions::SPEAK);
        harness.discord.set_voice_state(GUILD, UserId::new(5), Some(channel));
        let player = harness.player();

        let err = player.join_channel(channel).await.unwrap_err();
        assert!(matches!(err, PlayerError::ChannelFull));
    }

    #[tokio::test]
    async fn test_finished_track_advances_until_idle() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.queue(context("First", 1)).await.unwrap();
        player.queue(context("Second", 1)).await.unwrap();

        harness.emit(PlayerEvent::TrackEnd(TrackEndReason::Finished)).await;
        assert_eq!(player.playing_track().unwrap().effective_title(), "Second");

        harness.emit(PlayerEvent::TrackEnd(TrackEndReason::Finished)).await;
        assert!(player.playing_track().is_none());
        assert_eq!(player.status(), PlayerStatus::Stopped);
        assert_eq!(
            harness.played_titles(),
            vec!["First".to_string(), "Second".to_string()]
        );
    }

    #[tokio::test]
    async fn test_replaced_end_does_not_advance() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.queue(context("First", 1)).await.unwrap();
        player.queue(context("Second", 1)).await.unwrap();

        harness.emit(PlayerEvent::TrackEnd(TrackEndReason::Replaced)).await;
        assert_eq!(player.playing_track().unwrap().effective_title(), "First");
        assert_eq!(player.track_count(), 2);
    }

    #[tokio::test]
    async fn test_repeat_single_replays_without_announcing() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.discord.add_text_channel(GUILD, ChannelId::new(500), true);
        let player = harness.player();
        player.set_repeat_mode(RepeatMode::Single);
        player.queue(context("Loop", 1)).await.unwrap();
        let first_id = player.playing_track().unwrap().track_id();

        harness.emit(PlayerEvent::TrackStart).await;
        harness.emit(PlayerEvent::TrackEnd(TrackEndReason::Finished)).await;
        harness.emit(PlayerEvent::TrackStart).await;

        let current = player.playing_track().unwrap();
        assert_eq!(current.effective_title(), "Loop");
        assert_ne!(current.track_id(), first_id);
        assert!(harness.discord.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_track_start_announces_and_escapes() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.discord.add_text_channel(GUILD, ChannelId::new(500), true);
        let player = harness.player();
        player.queue(context("Best_Of *Hits*", 1)).await.unwrap();

        harness.emit(PlayerEvent::TrackStart).await;
        assert_eq!(
            harness.discord.sent_messages(),
            vec![(ChannelId::new(500), "Now playing **Best\\_Of \\*Hits\\***.".to_string())]
        );
    }

    #[tokio::test]
    async fn test_pause_resume_and_resume_when_idle() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();

        player.resume().await.unwrap();
        assert!(harness.handle().calls().is_empty());

        player.queue(context("First", 1)).await.unwrap();
        player.pause().await.unwrap();
        assert_eq!(player.status(), PlayerStatus::Paused);
        player.resume().await.unwrap();
        assert!(player.is_playing());
        assert!(harness.handle().calls().contains(&HandleCall::Paused(true)));
        assert!(harness.handle().calls().contains(&HandleCall::Paused(false)));
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_current() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.queue(context("First", 1)).await.unwrap();
        player.queue(context("Second", 1)).await.unwrap();

        player.stop().await.unwrap();
        assert!(player.is_queue_empty());
        assert_eq!(harness.handle().calls().last(), Some(&HandleCall::Stop));
    }

    #[tokio::test]
    async fn test_skip_tracks_removes_queue_then_skips_current() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.queue(context("A", 1)).await.unwrap();
        player.queue(context("B", 1)).await.unwrap();
        player.queue(context("C", 1)).await.unwrap();
        let tracks = player.remaining_tracks();

        player.skip_tracks(&ids(&[&tracks[0], &tracks[1]])).await.unwrap();
        assert_eq!(player.playing_track().unwrap().effective_title(), "C");
        assert_eq!(player.track_count(), 1);
    }

    #[tokio::test]
    async fn test_skip_authorization() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.listener(2, 100);
        harness.discord.add_moderator(GUILD, UserId::new(3));
        let player = harness.player();
        player.queue(context("Mine", 1)).await.unwrap();
        player.queue(context("Theirs", 2)).await.unwrap();
        let tracks = player.remaining_tracks();

        assert_eq!(
            player.can_member_skip_tracks(UserId::new(2), &ids(&[&tracks[0]])),
            SkipDecision::Denied(SkipDenial::CurrentTrackNotOwned)
        );
        assert_eq!(
            player.can_member_skip_tracks(UserId::new(1), &ids(&[&tracks[1]])),
            SkipDecision::Denied(SkipDenial::QueuedTracksNotOwned)
        );
        assert_eq!(
            player.can_member_skip_tracks(UserId::new(2), &ids(&[&tracks[1]])),
            SkipDecision::Allowed
        );
        assert_eq!(
            player.can_member_skip_tracks(UserId::new(3), &ids(&[&tracks[0], &tracks[1]])),
            SkipDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_vote_skip_needs_half_of_listeners() {
        let harness = Harness::new();
        for user in 1..=4 {
            harness.listener(user, 100);
        }
        harness.discord.add_bot_user(GUILD, UserId::new(77), ChannelId::new(100));
        let player = harness.player();
        player.queue(context("A", 1)).await.unwrap();
        player.queue(context("B", 1)).await.unwrap();

        let first = player.vote_skip(UserId::new(2)).await.unwrap();
        assert_eq!((first.votes, first.listeners, first.skipped), (1, 4, None));

        let again = player.vote_skip(UserId::new(2)).await.unwrap();
        assert!(!again.counted);

        let passed = player.vote_skip(UserId::new(3)).await.unwrap();
        assert_eq!(passed.skipped.as_deref(), Some("A"));
        assert_eq!(player.playing_track().unwrap().effective_title(), "B");

        harness.emit(PlayerEvent::TrackStart).await;
        let fresh = player.vote_skip(UserId::new(4)).await.unwrap();
        assert_eq!(fresh.votes, 1);
    }

    #[tokio::test]
    async fn test_vote_skip_requires_listener() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.listener(2, 200);
        let player = harness.player();
        player.queue(context("A", 1)).await.unwrap();

        let err = player.vote_skip(UserId::new(2)).await.unwrap_err();
        assert!(matches!(err, PlayerError::NotInSameChannel));
    }

    #[tokio::test]
    async fn test_tracks_in_range_puts_current_first() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        for title in ["A", "B", "C", "D"] {
            player.queue(context(title, 1)).await.unwrap();
        }

        let titles = |tracks: Vec<TrackContext>| -> Vec<String> {
            tracks.iter().map(|t| t.effective_title().to_string()).collect()
        };
        assert_eq!(titles(player.tracks_in_range(0, 2)), vec!["A", "B"]);
        assert_eq!(titles(player.tracks_in_range(1, 3)), vec!["B", "C"]);
        assert_eq!(titles(player.tracks_in_range(3, 10)), vec!["D"]);
    }

    #[tokio::test]
    async fn test_remaining_time_excludes_streams() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.queue(context("A", 1)).await.unwrap();
        player.queue(stream_context("Radio", 1)).await.unwrap();
        player.queue(context("B", 1)).await.unwrap();
        harness.handle().set_position(30_000);

        assert_eq!(player.total_remaining_ms().await, 150_000 + 180_000);
        assert_eq!(player.streams_count(), 1);
        assert_eq!(player.position_ms().await, 30_000);
    }

    #[tokio::test]
    async fn test_seek_and_volume_are_clamped() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.queue(context("A", 1)).await.unwrap();

        player.seek_to(999_999).await.unwrap();
        player.set_volume(9.0).await.unwrap();
        let calls = harness.handle().calls();
        assert!(calls.contains(&HandleCall::Seek(180_000)));
        assert!(calls.contains(&HandleCall::Volume(MAX_VOLUME)));
        assert_eq!(player.volume(), MAX_VOLUME);
    }

    #[tokio::test]
    async fn test_seek_while_idle_does_nothing() {
        let harness = Harness::new();
        let player = harness.player();

        player.seek_to(30_000).await.unwrap();
        assert!(harness.handle().calls().is_empty());
    }

    #[tokio::test]
    async fn test_refused_voice_join_keeps_queue_untouched() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.load_all(vec![context("Saved", 1)]).await;
        harness.backend.refuse_connections(true);

        let err = player.queue(context("First", 1)).await.unwrap_err();
        assert!(matches!(err, PlayerError::Connection(_)));
        assert!(err.is_retryable());
        assert_eq!(player.track_count(), 1);
        assert!(harness.played_titles().is_empty());

        let err = player.join_member_channel(UserId::new(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(harness.backend.connects().is_empty());

        harness.backend.refuse_connections(false);
        player.queue(context("First", 1)).await.unwrap();
        assert_eq!(harness.played_titles(), vec!["Saved".to_string()]);
        assert_eq!(player.track_count(), 2);
    }

    #[tokio::test]
    async fn test_track_start_is_silent_when_announcements_are_off() {
        let harness = Harness::with_guild_config(false, false);
        harness.listener(1, 100);
        harness.discord.add_text_channel(GUILD, ChannelId::new(500), true);
        let player = harness.player();
        player.queue(context("Quiet", 1)).await.unwrap();

        harness.emit(PlayerEvent::TrackStart).await;
        assert!(harness.discord.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_track_start_is_silent_while_paused() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.discord.add_text_channel(GUILD, ChannelId::new(500), true);
        let player = harness.player();
        player.queue(context("Held", 1)).await.unwrap();
        player.pause().await.unwrap();

        harness.emit(PlayerEvent::TrackStart).await;
        assert!(harness.discord.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_track_exception_posts_message() {
        let harness = Harness::new();
        harness.listener(1, 100);
        harness.discord.add_text_channel(GUILD, ChannelId::new(500), true);
        let player = harness.player();
        player.queue(context("A", 1)).await.unwrap();

        harness
            .emit(PlayerEvent::TrackException("video unavailable".into()))
            .await;
        assert_eq!(
            harness.discord.sent_messages(),
            vec![(
                ChannelId::new(500),
                "Something went wrong!\nvideo unavailable".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_destroy_is_terminal_and_idempotent() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.queue(context("A", 1)).await.unwrap();

        player.destroy().await;
        player.destroy().await;
        assert!(player.is_destroyed());
        assert!(player.is_queue_empty());
        assert_eq!(harness.backend.disconnects(), vec![GUILD]);
        assert_eq!(harness.discord.voice_state(GUILD, BOT_ID), None);
        assert_eq!(
            harness.handle().calls().iter().filter(|c| **c == HandleCall::Destroy).count(),
            1
        );

        harness.emit(PlayerEvent::TrackEnd(TrackEndReason::Finished)).await;
        assert!(player.playing_track().is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "used after it was destroyed")]
    async fn test_queue_after_destroy_panics() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let player = harness.player();
        player.destroy().await;
        let _ = player.queue(context("A", 1)).await;
    }
}
