use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use songbird::{
    input::YoutubeDl,
    tracks::{Track, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::{
    backend::{PlaybackHandle, PlayerEvent, PlayerEventListener, TrackEndReason},
    codec::AudioTrack,
    error::PlayerError,
};

const SPLIT_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Plays through the in-process songbird driver of the guild's call.
///
/// Every `play` bumps a generation counter. Songbird callbacks carry the generation
/// they were registered for, so callbacks of replaced or stopped tracks are dropped.
pub struct LocalPlayer {
    guild_id: GuildId,
    songbird: Arc<Songbird>,
    http: reqwest::Client,
    listener: Weak<dyn PlayerEventListener>,
    current: Mutex<Option<TrackHandle>>,
    generation: Arc<AtomicU64>,
}

impl LocalPlayer {
    pub fn new(
        guild_id: GuildId,
        songbird: Arc<Songbird>,
        http: reqwest::Client,
        listener: Weak<dyn PlayerEventListener>,
    ) -> Self {
        Self {
            guild_id,
            songbird,
            http,
            listener,
            current: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn invalidate(&self) -> Option<TrackHandle> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.current.lock().take()
    }

    fn current(&self) -> Option<TrackHandle> {
        self.current.lock().clone()
    }

    fn events(&self, generation: u64, kind: LocalEventKind) -> LocalTrackEvents {
        LocalTrackEvents {
            guild_id: self.guild_id,
            generation,
            live_generation: Arc::clone(&self.generation),
            listener: self.listener.clone(),
            kind,
            fired: AtomicBool::new(false),
        }
    }
}

fn backend_error(e: impl std::fmt::Display) -> PlayerError {
    PlayerError::Backend(e.to_string())
}

#[async_trait]
impl PlaybackHandle for LocalPlayer {
    async fn play(
        &self,
        track: &AudioTrack,
        start_ms: u64,
        end_ms: Option<u64>,
        volume: f32,
        paused: bool,
    ) -> Result<(), PlayerError> {
        let call = self
            .songbird
            .get(self.guild_id)
            .ok_or_else(|| PlayerError::Connection("no voice connection".to_string()))?;

        if let Some(old) = self.invalidate() {
            let _ = old.stop();
        }
        let generation = self.generation.load(Ordering::SeqCst);

        let input = YoutubeDl::new(self.http.clone(), track.locator().to_string());
        let mut next = Track::from(input).volume(volume);
        if paused {
            next = next.pause();
        }

        let handle = call.lock().await.play_only(next);
        if start_ms > 0 {
            // The driver answers once the input is ready, which can take a while.
            let seek = handle.seek(Duration::from_millis(start_ms));
            let guild_id = self.guild_id;
            tokio::spawn(async move {
                if let Err(e) = seek.result_async().await {
                    warn!("Could not seek to {}ms in guild {}: {:?}", start_ms, guild_id, e);
                }
            });
        }

        handle
            .add_event(Event::Track(TrackEvent::Play), self.events(generation, LocalEventKind::Start))
            .map_err(backend_error)?;
        handle
            .add_event(Event::Track(TrackEvent::End), self.events(generation, LocalEventKind::End))
            .map_err(backend_error)?;
        handle
            .add_event(Event::Track(TrackEvent::Error), self.events(generation, LocalEventKind::Error))
            .map_err(backend_error)?;
        if let Some(end_ms) = end_ms {
            handle
                .add_event(
                    Event::Periodic(SPLIT_CHECK_INTERVAL, None),
                    self.events(generation, LocalEventKind::SplitEnd(Duration::from_millis(end_ms))),
                )
                .map_err(backend_error)?;
        }

        debug!("▶️ Local playback of {} in guild {}", track.info.title, self.guild_id);
        *self.current.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PlayerError> {
        if let Some(handle) = self.invalidate() {
            handle.stop().map_err(backend_error)?;
        }
        Ok(())
    }

    async fn set_paused(&self, paused: bool) -> Result<(), PlayerError> {
        if let Some(handle) = self.current() {
            let result = if paused { handle.pause() } else { handle.play() };
            result.map_err(backend_error)?;
        }
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), PlayerError> {
        if let Some(handle) = self.current() {
            handle
                .seek_async(Duration::from_millis(position_ms))
                .await
                .map_err(backend_error)?;
        }
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        if let Some(handle) = self.current() {
            handle.set_volume(volume).map_err(backend_error)?;
        }
        Ok(())
    }

    async fn position_ms(&self) -> u64 {
        match self.current() {
            Some(handle) => handle
                .get_info()
                .await
                .map(|state| state.position.as_millis() as u64)
                .unwrap_or(0),
            None => 0,
        }
    }

    async fn destroy(&self) {
        if let Some(handle) = self.invalidate() {
            let _ = handle.stop();
        }
    }
}

#[derive(Clone, Copy)]
enum LocalEventKind {
    Start,
    End,
    Error,
    SplitEnd(Duration),
}

struct LocalTrackEvents {
    guild_id: GuildId,
    generation: u64,
    live_generation: Arc<AtomicU64>,
    listener: Weak<dyn PlayerEventListener>,
    kind: LocalEventKind,
    fired: AtomicBool,
}

impl LocalTrackEvents {
    fn is_stale(&self) -> bool {
        self.live_generation.load(Ordering::SeqCst) != self.generation
    }

    /// Ends are reported once per generation, whichever of end or error comes first.
    fn claim_end(&self) -> bool {
        self.live_generation
            .compare_exchange(
                self.generation,
                self.generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn dispatch(&self, events: Vec<PlayerEvent>) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for event in events {
                listener.on_player_event(event).await;
            }
        });
    }
}

#[async_trait]
impl VoiceEventHandler for LocalTrackEvents {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if self.is_stale() {
            return Some(Event::Cancel);
        }

        match self.kind {
            // Play also fires on every resume; only the first one is a track start.
            LocalEventKind::Start => {
                if !self.fired.swap(true, Ordering::SeqCst) {
                    self.dispatch(vec![PlayerEvent::TrackStart]);
                }
                None
            }
            LocalEventKind::End => {
                if !self.claim_end() {
                    return Some(Event::Cancel);
                }
                self.dispatch(vec![PlayerEvent::TrackEnd(TrackEndReason::Finished)]);
                Some(Event::Cancel)
            }
            LocalEventKind::Error => {
                let message = match ctx {
                    EventContext::Track(tracks) => tracks
                        .first()
                        .map(|(state, _)| format!("{:?}", state.playing))
                        .unwrap_or_else(|| "playback error".to_string()),
                    _ => "playback error".to_string(),
                };
                if !self.claim_end() {
                    return Some(Event::Cancel);
                }
                warn!("🔇 Local track failed in guild {}: {}", self.guild_id, message);
                self.dispatch(vec![
                    PlayerEvent::TrackException(message),
                    PlayerEvent::TrackEnd(TrackEndReason::LoadFailed),
                ]);
                Some(Event::Cancel)
            }
            LocalEventKind::SplitEnd(end) => {
                if let EventContext::Track(tracks) = ctx {
                    if let Some((state, handle)) = tracks.first() {
                        if state.position >= end {
                            debug!("✂️ Split window reached its end in guild {}", self.guild_id);
                            let _ = handle.stop();
                            return Some(Event::Cancel);
                        }
                    }
                }
                None
            }
        }
    }
}
