use async_trait::async_trait;

use crate::audio::codec::AudioTrack;
use crate::audio::error::PlayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Only natural ends advance the queue; the other reasons are caused by the player itself.
    pub fn may_start_next(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }

    pub fn from_relay(reason: &str) -> Self {
        match reason {
            "finished" => TrackEndReason::Finished,
            "loadFailed" => TrackEndReason::LoadFailed,
            "replaced" => TrackEndReason::Replaced,
            "cleanup" => TrackEndReason::Cleanup,
            _ => TrackEndReason::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    TrackStart,
    TrackEnd(TrackEndReason),
    TrackException(String),
}

/// Receives playback callbacks from a backend handle.
#[async_trait]
pub trait PlayerEventListener: Send + Sync {
    async fn on_player_event(&self, event: PlayerEvent);
}

/// One guild's playback handle on either backend.
///
/// Positions are absolute offsets into the underlying track, in milliseconds.
#[async_trait]
pub trait PlaybackHandle: Send + Sync {
    /// Starts `track`, replacing whatever was playing. Stops on its own at `end_ms`.
    async fn play(
        &self,
        track: &AudioTrack,
        start_ms: u64,
        end_ms: Option<u64>,
        volume: f32,
        paused: bool,
    ) -> Result<(), PlayerError>;

    async fn stop(&self) -> Result<(), PlayerError>;

    async fn set_paused(&self, paused: bool) -> Result<(), PlayerError>;

    async fn seek(&self, position_ms: u64) -> Result<(), PlayerError>;

    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError>;

    async fn position_ms(&self) -> u64;

    /// Releases backend resources. Further calls are undefined.
    async fn destroy(&self);
}
