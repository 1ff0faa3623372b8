//! In-memory guild, backend and player wiring shared by the audio tests.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::{
    id::{ChannelId, GuildId, UserId},
    Permissions,
};
use songbird::Songbird;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::audio::{
    backend::{PlaybackHandle, PlayerEvent, PlayerEventListener},
    codec::{AudioTrack, TrackInfo},
    connection::{AudioBackend, AudioConnectionFacade},
    error::PlayerError,
    player::{GuildPlayer, PlayerServices},
    text_channel::MusicTextChannelProvider,
    track::TrackContext,
};
use crate::gateway::{DiscordGateway, VoiceChannelInfo};
use crate::storage::MockGuildConfigService;

pub const GUILD: GuildId = GuildId::new(10);
pub const BOT_ID: UserId = UserId::new(999);

pub fn track(title: &str, length: u64, is_stream: bool) -> AudioTrack {
    AudioTrack::from_info(TrackInfo {
        identifier: format!("id-{title}"),
        title: title.to_string(),
        author: "Tester".into(),
        length,
        is_stream,
        uri: Some(format!("https://example.com/{title}")),
        source_name: "http".into(),
        ..Default::default()
    })
}

/// A three minute track queued by `user` in [`GUILD`].
pub fn context(title: &str, user: u64) -> TrackContext {
    TrackContext::new(track(title, 180_000, false), UserId::new(user), GUILD)
}

pub fn stream_context(title: &str, user: u64) -> TrackContext {
    TrackContext::new(track(title, 0, true), UserId::new(user), GUILD)
}

struct FakeVoiceChannel {
    name: String,
    user_limit: u32,
    perms: Permissions,
}

#[derive(Default)]
struct FakeGuilds {
    guilds: HashSet<GuildId>,
    members: HashSet<(GuildId, UserId)>,
    bots: HashSet<UserId>,
    moderators: HashSet<(GuildId, UserId)>,
    voice_states: HashMap<(GuildId, UserId), ChannelId>,
    voice_channels: HashMap<(GuildId, ChannelId), FakeVoiceChannel>,
    text_channels: Vec<(GuildId, ChannelId, bool)>,
    sent: Vec<(ChannelId, String)>,
}

/// Discord as seen through [`DiscordGateway`], backed by plain maps.
pub struct FakeDiscord {
    state: Mutex<FakeGuilds>,
}

impl FakeDiscord {
    pub fn new() -> Self {
        let mut state = FakeGuilds::default();
        state.bots.insert(BOT_ID);
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn add_guild(&self, guild_id: GuildId) {
        self.state.lock().guilds.insert(guild_id);
    }

    pub fn add_member(&self, guild_id: GuildId, user_id: UserId) {
        let mut state = self.state.lock();
        state.guilds.insert(guild_id);
        state.members.insert((guild_id, user_id));
    }

    pub fn add_moderator(&self, guild_id: GuildId, user_id: UserId) {
        self.add_member(guild_id, user_id);
        self.state.lock().moderators.insert((guild_id, user_id));
    }

    pub fn add_bot_user(&self, guild_id: GuildId, user_id: UserId, channel_id: ChannelId) {
        self.add_member(guild_id, user_id);
        self.state.lock().bots.insert(user_id);
        self.set_voice_state(guild_id, user_id, Some(channel_id));
    }

    pub fn add_voice_channel(&self, guild_id: GuildId, channel_id: ChannelId, user_limit: u32, perms: Permissions) {
        let mut state = self.state.lock();
        state.guilds.insert(guild_id);
        state.voice_channels.insert(
            (guild_id, channel_id),
            FakeVoiceChannel {
                name: format!("voice-{channel_id}"),
                user_limit,
                perms,
            },
        );
    }

    pub fn set_voice_state(&self, guild_id: GuildId, user_id: UserId, channel_id: Option<ChannelId>) {
        let mut state = self.state.lock();
        match channel_id {
            Some(channel_id) => state.voice_states.insert((guild_id, user_id), channel_id),
            None => state.voice_states.remove(&(guild_id, user_id)),
        };
    }

    pub fn voice_state(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
        self.state.lock().voice_states.get(&(guild_id, user_id)).copied()
    }

    /// Adds or replaces a text channel.
    pub fn add_text_channel(&self, guild_id: GuildId, channel_id: ChannelId, talkable: bool) {
        let mut state = self.state.lock();
        state.guilds.insert(guild_id);
        if let Some(entry) = state
            .text_channels
            .iter_mut()
            .find(|(g, c, _)| *g == guild_id && *c == channel_id)
        {
            entry.2 = talkable;
        } else {
            state.text_channels.push((guild_id, channel_id, talkable));
        }
    }

    pub fn sent_messages(&self) -> Vec<(ChannelId, String)> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl DiscordGateway for FakeDiscord {
    fn current_user_id(&self) -> Option<UserId> {
        Some(BOT_ID)
    }

    fn has_guild(&self, guild_id: GuildId) -> bool {
        self.state.lock().guilds.contains(&guild_id)
    }

    fn member_exists(&self, guild_id: GuildId, user_id: UserId) -> bool {
        user_id == BOT_ID || self.state.lock().members.contains(&(guild_id, user_id))
    }

    fn member_voice_channel(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
        self.voice_state(guild_id, user_id)
    }

    fn voice_channel(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<VoiceChannelInfo> {
        let state = self.state.lock();
        let channel = state.voice_channels.get(&(guild_id, channel_id))?;
        let mut members: Vec<UserId> = state
            .voice_states
            .iter()
            .filter(|((g, _), c)| *g == guild_id && **c == channel_id)
            .map(|((_, u), _)| *u)
            .collect();
        members.sort_unstable();
        let humans = members
            .iter()
            .copied()
            .filter(|u| !state.bots.contains(u))
            .collect();
        Some(VoiceChannelInfo {
            name: channel.name.clone(),
            user_limit: channel.user_limit,
            members,
            humans,
        })
    }

    fn self_permissions_in(&self, guild_id: GuildId, channel_id: ChannelId) -> Permissions {
        let state = self.state.lock();
        if let Some(channel) = state.voice_channels.get(&(guild_id, channel_id)) {
            return channel.perms;
        }
        let talkable = state
            .text_channels
            .iter()
            .any(|(g, c, talkable)| *g == guild_id && *c == channel_id && *talkable);
        if talkable {
            Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES
        } else {
            Permissions::empty()
        }
    }

    fn is_moderator(&self, guild_id: GuildId, user_id: UserId) -> bool {
        self.state.lock().moderators.contains(&(guild_id, user_id))
    }

    fn text_channels(&self, guild_id: GuildId) -> Vec<ChannelId> {
        self.state
            .lock()
            .text_channels
            .iter()
            .filter(|(g, _, talkable)| *g == guild_id && *talkable)
            .map(|(_, c, _)| *c)
            .collect()
    }

    async fn send_message(&self, channel_id: ChannelId, content: &str) -> Result<()> {
        self.state.lock().sent.push((channel_id, content.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandleCall {
    Play {
        title: String,
        start_ms: u64,
        end_ms: Option<u64>,
        paused: bool,
    },
    Stop,
    Paused(bool),
    Seek(u64),
    Volume(f32),
    Destroy,
}

/// Playback handle that records what it was asked to do.
pub struct FakeHandle {
    listener: Weak<dyn PlayerEventListener>,
    calls: Mutex<Vec<HandleCall>>,
    position: AtomicU64,
}

impl FakeHandle {
    pub fn calls(&self) -> Vec<HandleCall> {
        self.calls.lock().clone()
    }

    pub fn played_titles(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                HandleCall::Play { title, .. } => Some(title.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_position(&self, position_ms: u64) {
        self.position.store(position_ms, Ordering::SeqCst);
    }

    pub async fn emit(&self, event: PlayerEvent) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_player_event(event).await;
        }
    }

    fn record(&self, call: HandleCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PlaybackHandle for FakeHandle {
    async fn play(
        &self,
        track: &AudioTrack,
        start_ms: u64,
        end_ms: Option<u64>,
        _volume: f32,
        paused: bool,
    ) -> Result<(), PlayerError> {
        self.set_position(start_ms);
        self.record(HandleCall::Play {
            title: track.info.title.clone(),
            start_ms,
            end_ms,
            paused,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlayerError> {
        self.record(HandleCall::Stop);
        Ok(())
    }

    async fn set_paused(&self, paused: bool) -> Result<(), PlayerError> {
        self.record(HandleCall::Paused(paused));
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), PlayerError> {
        self.set_position(position_ms);
        self.record(HandleCall::Seek(position_ms));
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        self.record(HandleCall::Volume(volume));
        Ok(())
    }

    async fn position_ms(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    async fn destroy(&self) {
        self.record(HandleCall::Destroy);
    }
}

/// Voice backend that moves the fake bot between channels.
pub struct FakeBackend {
    discord: Arc<FakeDiscord>,
    connects: Mutex<Vec<(GuildId, ChannelId)>>,
    disconnects: Mutex<Vec<GuildId>>,
    connected: Mutex<HashSet<GuildId>>,
    handles: Mutex<HashMap<GuildId, Arc<FakeHandle>>>,
    refuse_connect: AtomicBool,
}

impl FakeBackend {
    pub fn new(discord: Arc<FakeDiscord>) -> Self {
        Self {
            discord,
            connects: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            connected: Mutex::new(HashSet::new()),
            handles: Mutex::new(HashMap::new()),
            refuse_connect: AtomicBool::new(false),
        }
    }

    pub fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), PlayerError> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(PlayerError::Connection("voice server unreachable".into()));
        }
        self.connects.lock().push((guild_id, channel_id));
        self.connected.lock().insert(guild_id);
        self.discord.set_voice_state(guild_id, BOT_ID, Some(channel_id));
        Ok(())
    }

    pub fn disconnect(&self, guild_id: GuildId) {
        if self.connected.lock().remove(&guild_id) {
            self.disconnects.lock().push(guild_id);
            self.discord.set_voice_state(guild_id, BOT_ID, None);
        }
    }

    pub fn is_connected(&self, guild_id: GuildId) -> bool {
        self.connected.lock().contains(&guild_id)
    }

    pub fn create_player(
        &self,
        guild_id: GuildId,
        listener: Weak<dyn PlayerEventListener>,
    ) -> Arc<dyn PlaybackHandle> {
        let handle = Arc::new(FakeHandle {
            listener,
            calls: Mutex::new(Vec::new()),
            position: AtomicU64::new(0),
        });
        self.handles.lock().insert(guild_id, Arc::clone(&handle));
        handle
    }

    pub fn handle(&self, guild_id: GuildId) -> Option<Arc<FakeHandle>> {
        self.handles.lock().get(&guild_id).cloned()
    }

    pub fn connects(&self) -> Vec<(GuildId, ChannelId)> {
        self.connects.lock().clone()
    }

    pub fn disconnects(&self) -> Vec<GuildId> {
        self.disconnects.lock().clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }
}

/// Fake guild plus backend wired into [`PlayerServices`].
pub struct Harness {
    pub discord: Arc<FakeDiscord>,
    pub backend: Arc<FakeBackend>,
    pub services: PlayerServices,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_guild_config(true, false)
    }

    pub fn with_guild_config(track_announce: bool, auto_resume: bool) -> Self {
        let discord = Arc::new(FakeDiscord::new());
        discord.add_guild(GUILD);
        let backend = Arc::new(FakeBackend::new(Arc::clone(&discord)));
        let facade = AudioConnectionFacade::new(
            Songbird::serenity(),
            reqwest::Client::new(),
            AudioBackend::Fake(Arc::clone(&backend)),
        );

        let mut guild_config = MockGuildConfigService::new();
        guild_config.expect_track_announce().return_const(track_announce);
        guild_config.expect_auto_resume().return_const(auto_resume);

        let services = PlayerServices {
            facade: Arc::new(facade),
            gateway: Arc::clone(&discord) as Arc<dyn DiscordGateway>,
            guild_config: Arc::new(guild_config),
            text_channels: Arc::new(MusicTextChannelProvider::new()),
            max_queue_size: 100,
        };
        Self {
            discord,
            backend,
            services,
        }
    }

    /// Puts a member into a voice channel the bot may join and speak in.
    pub fn listener(&self, user: u64, channel: u64) {
        self.listener_in(GUILD, user, channel);
    }

    pub fn listener_in(&self, guild_id: GuildId, user: u64, channel: u64) {
        let channel_id = ChannelId::new(channel);
        if self.discord.voice_channel(guild_id, channel_id).is_none() {
            self.discord.add_voice_channel(
                guild_id,
                channel_id,
                0,
                Permissions::CONNECT | Permissions::SPEAK,
            );
        }
        self.discord.add_member(guild_id, UserId::new(user));
        self.discord
            .set_voice_state(guild_id, UserId::new(user), Some(channel_id));
    }

    pub fn player(&self) -> Arc<GuildPlayer> {
        GuildPlayer::new(GUILD, self.services.clone(), 1.0)
    }

    pub fn handle(&self) -> Arc<FakeHandle> {
        self.handle_for(GUILD)
    }

    pub fn handle_for(&self, guild_id: GuildId) -> Arc<FakeHandle> {
        match self.backend.handle(guild_id) {
            Some(handle) => handle,
            None => panic!("no player was created for guild {guild_id}"),
        }
    }

    pub async fn emit(&self, event: PlayerEvent) {
        self.handle().emit(event).await;
    }

    pub fn played_titles(&self) -> Vec<String> {
        self.handle().played_titles()
    }
}
