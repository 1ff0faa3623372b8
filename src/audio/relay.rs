//! Client for Lavalink v4 compatible relay nodes.
//!
//! Each node keeps one websocket session open (reconnecting with backoff) that
//! delivers `ready`, `playerUpdate` and `event` ops. Player changes go through the
//! REST API of the session. Guilds stick to the node they were first assigned to
//! while that node stays connected.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{
    backend::{PlaybackHandle, PlayerEvent, PlayerEventListener, TrackEndReason},
    codec::AudioTrack,
    error::{PlayerError, RelayError},
};
use crate::config::RelayNodeConfig;
use crate::executor::TaskExecutor;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_MAX_EXPONENT: u32 = 5;

struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn next(&mut self) -> Duration {
        let delay = BACKOFF_BASE_MS * 2u64.pow(self.attempt.min(BACKOFF_MAX_EXPONENT));
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Result of `GET /v4/loadtracks`.
#[derive(Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    Track(AudioTrack),
    Playlist(RelayPlaylist),
    Search(Vec<AudioTrack>),
    Empty(Value),
    Error(RelayException),
}

#[derive(Debug, Deserialize)]
pub struct RelayPlaylist {
    pub info: RelayPlaylistInfo,
    pub tracks: Vec<AudioTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPlaylistInfo {
    pub name: String,
    #[serde(default)]
    pub selected_track: i64,
}

#[derive(Debug, Deserialize)]
pub struct RelayException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum RelayMessage {
    #[serde(rename_all = "camelCase")]
    Ready {
        session_id: String,
        #[serde(default)]
        resumed: bool,
    },
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: String,
        state: RelayPlayerState,
    },
    Event(RelayEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RelayPlayerState {
    #[serde(default)]
    position: u64,
}

/// Tag attached to every played track as `userData`; nodes echo it in track events.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayTag {
    #[serde(default)]
    play_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayEventTrack {
    #[serde(default)]
    user_data: Option<PlayTag>,
}

fn play_id_of(track: &Option<RelayEventTrack>) -> Option<u64> {
    track.as_ref()?.user_data.as_ref()?.play_id
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RelayEvent {
    #[serde(rename_all = "camelCase")]
    TrackStartEvent {
        guild_id: String,
        #[serde(default)]
        track: Option<RelayEventTrack>,
    },
    #[serde(rename_all = "camelCase")]
    TrackEndEvent {
        guild_id: String,
        reason: String,
        #[serde(default)]
        track: Option<RelayEventTrack>,
    },
    #[serde(rename_all = "camelCase")]
    TrackExceptionEvent {
        guild_id: String,
        exception: RelayException,
        #[serde(default)]
        track: Option<RelayEventTrack>,
    },
    #[serde(rename_all = "camelCase")]
    TrackStuckEvent {
        guild_id: String,
        threshold_ms: u64,
        #[serde(default)]
        track: Option<RelayEventTrack>,
    },
    #[serde(rename_all = "camelCase")]
    WebSocketClosedEvent {
        guild_id: String,
        code: u16,
        reason: String,
    },
    #[serde(other)]
    Unknown,
}

fn parse_guild(raw: &str) -> Option<GuildId> {
    raw.parse::<u64>().ok().filter(|id| *id != 0).map(GuildId::new)
}

/// Event routing of one guild.
struct RelaySlot {
    /// Id of the [`RelayPlayer`] that registered the slot.
    handle: u64,
    listener: Weak<dyn PlayerEventListener>,
    /// Play id of the track the node is expected to be playing.
    playing: Option<u64>,
}

/// Callbacks and positions shared by all nodes of a pool.
#[derive(Default)]
struct RelayShared {
    slots: DashMap<GuildId, RelaySlot>,
    positions: DashMap<GuildId, u64>,
    handle_ids: AtomicU64,
    play_ids: AtomicU64,
}

impl RelayShared {
    /// Routes the guild's events to `listener`, replacing any earlier registration.
    fn register(&self, guild_id: GuildId, listener: Weak<dyn PlayerEventListener>) -> u64 {
        let handle = self.handle_ids.fetch_add(1, Ordering::SeqCst) + 1;
        self.slots.insert(
            guild_id,
            RelaySlot {
                handle,
                listener,
                playing: None,
            },
        );
        handle
    }

    /// Removes the guild's routing only while `handle` still owns it.
    fn unregister(&self, guild_id: GuildId, handle: u64) -> bool {
        self.slots
            .remove_if(&guild_id, |_, slot| slot.handle == handle)
            .is_some()
    }

    /// Marks a new track as current and returns the play id to tag it with.
    fn begin_play(&self, guild_id: GuildId, handle: u64) -> u64 {
        let play_id = self.play_ids.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut slot) = self.slots.get_mut(&guild_id) {
            if slot.handle == handle {
                slot.playing = Some(play_id);
            }
        }
        play_id
    }

    fn clear_play(&self, guild_id: GuildId, handle: u64) {
        if let Some(mut slot) = self.slots.get_mut(&guild_id) {
            if slot.handle == handle {
                slot.playing = None;
            }
        }
    }

    /// Forwards events to the guild's listener.
    ///
    /// Events tagged with a play id other than the current one belong to a track that
    /// was already replaced or stopped and are dropped. An end is forwarded once per play.
    fn dispatch(&self, guild_id: GuildId, play_id: Option<u64>, ends_track: bool, events: Vec<PlayerEvent>) {
        let listener = {
            let Some(mut slot) = self.slots.get_mut(&guild_id) else {
                debug!("No relay listener for guild {}", guild_id);
                return;
            };
            if let Some(play_id) = play_id {
                if slot.playing != Some(play_id) {
                    debug!("Dropping stale relay event of play {} in guild {}", play_id, guild_id);
                    return;
                }
                if ends_track {
                    slot.playing = None;
                }
            }
            slot.listener.upgrade()
        };
        let Some(listener) = listener else {
            return;
        };
        tokio::spawn(async move {
            for event in events {
                listener.on_player_event(event).await;
            }
        });
    }
}

pub struct RelayNode {
    config: RelayNodeConfig,
    rest_base: String,
    session_id: RwLock<Option<String>>,
    shared: Arc<RelayShared>,
}

impl RelayNode {
    fn new(config: RelayNodeConfig, shared: Arc<RelayShared>) -> Result<Self, RelayError> {
        let mut rest = url::Url::parse(&config.ws_url)
            .map_err(|_| RelayError::Address(config.ws_url.clone()))?;
        let scheme = if rest.scheme() == "wss" { "https" } else { "http" };
        rest.set_scheme(scheme)
            .map_err(|_| RelayError::Address(config.ws_url.clone()))?;
        Ok(Self {
            rest_base: rest.as_str().trim_end_matches('/').to_string(),
            config,
            session_id: RwLock::new(None),
            shared,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_connected(&self) -> bool {
        self.session_id.read().is_some()
    }

    fn session(&self) -> Result<String, RelayError> {
        self.session_id.read().clone().ok_or(RelayError::NotConnected)
    }

    async fn run(self: Arc<Self>, user_id: UserId, cancel: CancellationToken) {
        let mut backoff = Backoff::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect_once(user_id, &mut backoff) => match result {
                    Ok(()) => warn!("🔌 Relay node {} closed the session", self.name()),
                    Err(e) => warn!("🔌 Relay node {} unreachable: {}", self.name(), e),
                },
            }
            *self.session_id.write() = None;

            let delay = backoff.next();
            debug!("Reconnecting to relay node {} in {:?}", self.name(), delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        *self.session_id.write() = None;
        info!("Relay node {} stopped", self.name());
    }

    async fn connect_once(&self, user_id: UserId, backoff: &mut Backoff) -> Result<(), RelayError> {
        let mut request = format!("{}/v4/websocket", self.config.ws_url).into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&self.config.password)
                .map_err(|_| RelayError::Address(self.config.name.clone()))?,
        );
        headers.insert("User-Id", HeaderValue::from(user_id.get()));
        headers.insert(
            "Client-Name",
            HeaderValue::from_static(concat!("fredboat/", env!("CARGO_PKG_VERSION"))),
        );

        let (mut stream, _) = tokio_tungstenite::connect_async(request).await?;
        backoff.reset();
        debug!("Websocket open to relay node {}", self.name());

        while let Some(message) = stream.next().await {
            match message? {
                Message::Text(text) => self.handle_message(&text),
                Message::Close(frame) => {
                    debug!("Relay node {} sent close: {:?}", self.name(), frame);
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_message(&self, raw: &str) {
        let message: RelayMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unreadable message from relay node {}: {}", self.name(), e);
                return;
            }
        };

        match message {
            RelayMessage::Ready { session_id, resumed } => {
                info!(
                    "✅ Relay node {} ready (session {}, resumed: {})",
                    self.name(),
                    session_id,
                    resumed
                );
                *self.session_id.write() = Some(session_id);
            }
            RelayMessage::PlayerUpdate { guild_id, state } => {
                if let Some(guild_id) = parse_guild(&guild_id) {
                    self.shared.positions.insert(guild_id, state.position);
                }
            }
            RelayMessage::Event(event) => self.handle_event(event),
            RelayMessage::Other => {}
        }
    }

    fn handle_event(&self, event: RelayEvent) {
        let (guild_id, play_id, ends_track, events) = match event {
            RelayEvent::TrackStartEvent { guild_id, track } => {
                (guild_id, play_id_of(&track), false, vec![PlayerEvent::TrackStart])
            }
            RelayEvent::TrackEndEvent { guild_id, reason, track } => (
                guild_id,
                play_id_of(&track),
                true,
                vec![PlayerEvent::TrackEnd(TrackEndReason::from_relay(&reason))],
            ),
            RelayEvent::TrackExceptionEvent {
                guild_id,
                exception,
                track,
            } => {
                let message = exception
                    .message
                    .unwrap_or_else(|| format!("{} failure", exception.severity));
                (
                    guild_id,
                    play_id_of(&track),
                    false,
                    vec![PlayerEvent::TrackException(message)],
                )
            }
            RelayEvent::TrackStuckEvent {
                guild_id,
                threshold_ms,
                track,
            } => (
                guild_id,
                play_id_of(&track),
                true,
                vec![
                    PlayerEvent::TrackException(format!("Track got stuck for {}ms", threshold_ms)),
                    PlayerEvent::TrackEnd(TrackEndReason::LoadFailed),
                ],
            ),
            RelayEvent::WebSocketClosedEvent { guild_id, code, reason } => {
                warn!(
                    "Relay voice socket closed for guild {}: {} {}",
                    guild_id, code, reason
                );
                return;
            }
            RelayEvent::Unknown => return,
        };

        if let Some(guild_id) = parse_guild(&guild_id) {
            self.shared.dispatch(guild_id, play_id, ends_track, events);
        }
    }

    async fn update_player(
        &self,
        http: &reqwest::Client,
        guild_id: GuildId,
        body: Value,
    ) -> Result<(), RelayError> {
        let url = format!(
            "{}/v4/sessions/{}/players/{}?noReplace=false",
            self.rest_base,
            self.session()?,
            guild_id
        );
        let response = http
            .patch(url)
            .header("Authorization", &self.config.password)
            .json(&body)
            .send()
            .await?;
        check_status(response).await
    }

    async fn delete_player(&self, http: &reqwest::Client, guild_id: GuildId) -> Result<(), RelayError> {
        let url = format!(
            "{}/v4/sessions/{}/players/{}",
            self.rest_base,
            self.session()?,
            guild_id
        );
        let response = http
            .delete(url)
            .header("Authorization", &self.config.password)
            .send()
            .await?;
        check_status(response).await
    }

    async fn load_tracks(&self, http: &reqwest::Client, identifier: &str) -> Result<LoadResult, RelayError> {
        let url = format!(
            "{}/v4/loadtracks?identifier={}",
            self.rest_base,
            urlencoding::encode(identifier)
        );
        let response = http
            .get(url)
            .header("Authorization", &self.config.password)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), RelayError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(RelayError::Status {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

/// Voice credentials for one guild, assembled from gateway events.
#[derive(Debug, Clone, Default)]
struct VoiceSlot {
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
    channel_id: Option<ChannelId>,
}

impl VoiceSlot {
    fn payload(&self) -> Option<Value> {
        Some(json!({
            "voice": {
                "token": self.token.as_ref()?,
                "endpoint": self.endpoint.as_ref()?,
                "sessionId": self.session_id.as_ref()?,
            }
        }))
    }
}

pub struct RelayPool {
    nodes: Vec<Arc<RelayNode>>,
    shared: Arc<RelayShared>,
    http: reqwest::Client,
    assignments: DashMap<GuildId, usize>,
    voice: DashMap<GuildId, VoiceSlot>,
    cancel: CancellationToken,
}

impl RelayPool {
    pub fn new(configs: &[RelayNodeConfig], http: reqwest::Client) -> Result<Self, RelayError> {
        let shared = Arc::new(RelayShared::default());
        let nodes = configs
            .iter()
            .cloned()
            .map(|config| RelayNode::new(config, Arc::clone(&shared)).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            nodes,
            shared,
            http,
            assignments: DashMap::new(),
            voice: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Opens the node sessions. Needs the bot user id, so it runs once the bot is logged in.
    pub fn start(&self, user_id: UserId, executor: &TaskExecutor) {
        for node in &self.nodes {
            info!("🎼 Connecting to relay node {} ({})", node.name(), node.config.ws_url);
            executor.spawn("relay-node", Arc::clone(node).run(user_id, self.cancel.clone()));
        }
    }

    fn node_for(&self, guild_id: GuildId) -> Result<Arc<RelayNode>, RelayError> {
        if let Some(index) = self.assignments.get(&guild_id).map(|i| *i) {
            if self.nodes[index].is_connected() {
                return Ok(Arc::clone(&self.nodes[index]));
            }
        }
        if self.nodes.is_empty() {
            return Err(RelayError::NotConnected);
        }

        let preferred = (guild_id.get() % self.nodes.len() as u64) as usize;
        let index = std::iter::once(preferred)
            .chain(0..self.nodes.len())
            .find(|i| self.nodes[*i].is_connected())
            .ok_or(RelayError::NotConnected)?;
        self.assignments.insert(guild_id, index);
        Ok(Arc::clone(&self.nodes[index]))
    }

    pub fn create_player(
        self: &Arc<Self>,
        guild_id: GuildId,
        listener: Weak<dyn PlayerEventListener>,
    ) -> RelayPlayer {
        let handle = self.shared.register(guild_id, listener);
        RelayPlayer {
            guild_id,
            handle,
            pool: Arc::clone(self),
        }
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, RelayError> {
        let node = self
            .nodes
            .iter()
            .find(|n| n.is_connected())
            .ok_or(RelayError::NotConnected)?;
        node.load_tracks(&self.http, identifier).await
    }

    async fn update(&self, guild_id: GuildId, body: Value) -> Result<(), RelayError> {
        let node = self.node_for(guild_id)?;
        node.update_player(&self.http, guild_id, body).await
    }

    /// Sends complete voice credentials for the guild to its node.
    pub async fn connect_voice(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        session_id: String,
        token: String,
        endpoint: String,
    ) -> Result<(), RelayError> {
        let slot = VoiceSlot {
            session_id: Some(session_id),
            token: Some(token),
            endpoint: Some(endpoint),
            channel_id: Some(channel_id),
        };
        let payload = slot.payload();
        self.voice.insert(guild_id, slot);
        match payload {
            Some(body) => self.update(guild_id, body).await,
            None => Ok(()),
        }
    }

    pub async fn on_voice_state(
        &self,
        guild_id: GuildId,
        session_id: String,
        channel_id: Option<ChannelId>,
    ) -> Result<(), RelayError> {
        if channel_id.is_none() {
            self.voice.remove(&guild_id);
            return Ok(());
        }
        let payload = {
            let mut slot = self.voice.entry(guild_id).or_default();
            slot.session_id = Some(session_id);
            slot.channel_id = channel_id;
            slot.payload()
        };
        match payload {
            Some(body) => self.update(guild_id, body).await,
            None => Ok(()),
        }
    }

    pub async fn on_voice_server(
        &self,
        guild_id: GuildId,
        token: String,
        endpoint: Option<String>,
    ) -> Result<(), RelayError> {
        let payload = {
            let mut slot = self.voice.entry(guild_id).or_default();
            slot.token = Some(token);
            slot.endpoint = endpoint;
            slot.payload()
        };
        match payload {
            Some(body) => self.update(guild_id, body).await,
            None => Ok(()),
        }
    }

    pub async fn disconnect(&self, guild_id: GuildId) {
        self.voice.remove(&guild_id);
        self.shared.positions.remove(&guild_id);
        if let Some((_, index)) = self.assignments.remove(&guild_id) {
            let node = &self.nodes[index];
            if node.is_connected() {
                if let Err(e) = node.delete_player(&self.http, guild_id).await {
                    warn!("Could not delete relay player for guild {}: {}", guild_id, e);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        info!("🎼 Closing {} relay node session(s)", self.nodes.len());
        self.cancel.cancel();
    }
}

/// Playback handle whose player lives on a relay node.
///
/// A guild may get a new handle while an old one is still being destroyed; the old
/// handle then leaves the guild's routing and node player alone.
pub struct RelayPlayer {
    guild_id: GuildId,
    handle: u64,
    pool: Arc<RelayPool>,
}

#[async_trait]
impl PlaybackHandle for RelayPlayer {
    async fn play(
        &self,
        track: &AudioTrack,
        start_ms: u64,
        end_ms: Option<u64>,
        volume: f32,
        paused: bool,
    ) -> Result<(), PlayerError> {
        let play_id = self.pool.shared.begin_play(self.guild_id, self.handle);
        let tag = PlayTag {
            play_id: Some(play_id),
        };
        let mut body = json!({
            "track": { "encoded": track.encoded, "userData": tag },
            "position": start_ms,
            "volume": relay_volume(volume),
            "paused": paused,
        });
        if let Some(end_ms) = end_ms {
            body["endTime"] = json!(end_ms);
        }
        self.pool.shared.positions.insert(self.guild_id, start_ms);
        Ok(self.pool.update(self.guild_id, body).await?)
    }

    async fn stop(&self) -> Result<(), PlayerError> {
        self.pool.shared.clear_play(self.guild_id, self.handle);
        Ok(self
            .pool
            .update(self.guild_id, json!({ "track": { "encoded": null } }))
            .await?)
    }

    async fn set_paused(&self, paused: bool) -> Result<(), PlayerError> {
        Ok(self.pool.update(self.guild_id, json!({ "paused": paused })).await?)
    }

    async fn seek(&self, position_ms: u64) -> Result<(), PlayerError> {
        self.pool.shared.positions.insert(self.guild_id, position_ms);
        Ok(self
            .pool
            .update(self.guild_id, json!({ "position": position_ms }))
            .await?)
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        Ok(self
            .pool
            .update(self.guild_id, json!({ "volume": relay_volume(volume) }))
            .await?)
    }

    async fn position_ms(&self) -> u64 {
        self.pool
            .shared
            .positions
            .get(&self.guild_id)
            .map(|p| *p)
            .unwrap_or(0)
    }

    async fn destroy(&self) {
        if !self.pool.shared.unregister(self.guild_id, self.handle) {
            debug!("Relay player of guild {} already belongs to a newer handle", self.guild_id);
            return;
        }
        if let Err(e) = self
            .pool
            .update(self.guild_id, json!({ "track": { "encoded": null } }))
            .await
        {
            match e {
                RelayError::NotConnected => {}
                other => error!("Failed to stop relay player for guild {}: {}", self.guild_id, other),
            }
        }
    }
}

/// Relay volume is an integer percentage.
fn relay_volume(volume: f32) -> u32 {
    (volume.max(0.0) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backoff_is_bounded_and_resets() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 32_000, 32_000]);
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn test_rest_base_follows_websocket_scheme() {
        let shared = Arc::new(RelayShared::default());
        let node = RelayNode::new(
            RelayNodeConfig {
                name: "a".into(),
                ws_url: "wss://relay.example:443".into(),
                password: "pw".into(),
            },
            shared,
        )
        .unwrap();
        assert_eq!(node.rest_base, "https://relay.example");
    }

    #[test]
    fn test_load_result_shapes() {
        let track = AudioTrack::from_info(crate::audio::codec::TrackInfo {
            identifier: "x".into(),
            title: "X".into(),
            length: 1_000,
            source_name: "http".into(),
            ..Default::default()
        });
        let raw = json!({
            "loadType": "playlist",
            "data": {
                "info": { "name": "Mix", "selectedTrack": -1 },
                "pluginInfo": {},
                "tracks": [{
                    "encoded": track.encoded,
                    "info": {
                        "identifier": "x", "isSeekable": true, "author": "", "length": 1000,
                        "isStream": false, "position": 0, "title": "X", "uri": null,
                        "artworkUrl": null, "isrc": null, "sourceName": "http"
                    },
                    "pluginInfo": {}, "userData": {}
                }]
            }
        });
        match serde_json::from_value::<LoadResult>(raw).unwrap() {
            LoadResult::Playlist(playlist) => {
                assert_eq!(playlist.info.name, "Mix");
                assert_eq!(playlist.tracks, vec![track]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let empty: LoadResult = serde_json::from_str(r#"{"loadType":"empty","data":{}}"#).unwrap();
        assert!(matches!(empty, LoadResult::Empty(_)));
    }

    #[test]
    fn test_messages_update_session_and_positions() {
        let shared = Arc::new(RelayShared::default());
        let node = RelayNode::new(
            RelayNodeConfig {
                name: "a".into(),
                ws_url: "ws://localhost:2333".into(),
                password: "pw".into(),
            },
            Arc::clone(&shared),
        )
        .unwrap();

        node.handle_message(r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#);
        assert!(node.is_connected());

        node.handle_message(
            r#"{"op":"playerUpdate","guildId":"42","state":{"time":1,"position":5000,"connected":true,"ping":3}}"#,
        );
        assert_eq!(shared.positions.get(&GuildId::new(42)).map(|p| *p), Some(5_000));

        node.handle_message(r#"{"op":"stats","players":1}"#);
        node.handle_message("not json");
    }

    const GUILD: GuildId = GuildId::new(42);

    struct Recorder {
        events: tokio::sync::mpsc::UnboundedSender<PlayerEvent>,
    }

    #[async_trait]
    impl PlayerEventListener for Recorder {
        async fn on_player_event(&self, event: PlayerEvent) {
            let _ = self.events.send(event);
        }
    }

    fn recorder() -> (
        Arc<dyn PlayerEventListener>,
        tokio::sync::mpsc::UnboundedReceiver<PlayerEvent>,
    ) {
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Recorder { events }), rx)
    }

    async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<PlayerEvent>) -> Option<PlayerEvent> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn pool() -> Arc<RelayPool> {
        let node = RelayNodeConfig {
            name: "a".into(),
            ws_url: "ws://localhost:2333".into(),
            password: "pw".into(),
        };
        Arc::new(RelayPool::new(&[node], reqwest::Client::new()).unwrap())
    }

    fn track_event(kind: &str, play_id: u64) -> String {
        json!({
            "op": "event",
            "type": kind,
            "guildId": "42",
            "reason": "finished",
            "track": { "encoded": "x", "info": {}, "userData": { "playId": play_id } }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_destroying_a_replaced_player_keeps_the_new_routing() {
        let pool = pool();
        let (old_listener, mut old_rx) = recorder();
        let (new_listener, mut new_rx) = recorder();
        let old = pool.create_player(GUILD, Arc::downgrade(&old_listener));
        let new = pool.create_player(GUILD, Arc::downgrade(&new_listener));

        old.destroy().await;
        let play_id = pool.shared.begin_play(GUILD, new.handle);
        pool.nodes[0].handle_message(&track_event("TrackStartEvent", play_id));
        assert_eq!(next_event(&mut new_rx).await, Some(PlayerEvent::TrackStart));
        assert_eq!(next_event(&mut old_rx).await, None);

        new.destroy().await;
        pool.nodes[0].handle_message(&track_event("TrackStartEvent", play_id));
        assert_eq!(next_event(&mut new_rx).await, None);
    }

    #[tokio::test]
    async fn test_end_of_a_replaced_track_is_dropped() {
        let pool = pool();
        let (listener, mut rx) = recorder();
        let player = pool.create_player(GUILD, Arc::downgrade(&listener));
        let skipped = pool.shared.begin_play(GUILD, player.handle);
        let current = pool.shared.begin_play(GUILD, player.handle);
        let node = &pool.nodes[0];

        node.handle_message(&track_event("TrackEndEvent", skipped));
        assert_eq!(next_event(&mut rx).await, None);

        node.handle_message(&track_event("TrackEndEvent", current));
        assert_eq!(
            next_event(&mut rx).await,
            Some(PlayerEvent::TrackEnd(TrackEndReason::Finished))
        );

        node.handle_message(&track_event("TrackEndEvent", current));
        assert_eq!(next_event(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_untagged_events_are_forwarded() {
        let pool = pool();
        let (listener, mut rx) = recorder();
        let _player = pool.create_player(GUILD, Arc::downgrade(&listener));

        pool.nodes[0].handle_message(
            r#"{"op":"event","type":"TrackEndEvent","guildId":"42","reason":"loadFailed"}"#,
        );
        assert_eq!(
            next_event(&mut rx).await,
            Some(PlayerEvent::TrackEnd(TrackEndReason::LoadFailed))
        );
    }

    #[test]
    fn test_voice_slot_needs_all_parts() {
        let mut slot = VoiceSlot {
            session_id: Some("s".into()),
            ..Default::default()
        };
        assert!(slot.payload().is_none());
        slot.token = Some("t".into());
        slot.endpoint = Some("e".into());
        assert_eq!(
            slot.payload(),
            Some(json!({ "voice": { "token": "t", "endpoint": "e", "sessionId": "s" } }))
        );
    }
}
