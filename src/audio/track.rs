use serenity::model::id::{GuildId, UserId};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::codec::AudioTrack;

/// A chapter carved out of a longer track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitWindow {
    pub title: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl SplitWindow {
    pub fn new(title: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        let (start_ms, end_ms) = if start_ms <= end_ms {
            (start_ms, end_ms)
        } else {
            (end_ms, start_ms)
        };
        Self {
            title: title.into(),
            start_ms,
            end_ms,
        }
    }

    pub fn length_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

/// One queued playable item plus who asked for it.
///
/// Contexts are never mutated once built. The underlying [`AudioTrack`] is shared
/// between clones; each playback creates its own backend handle from it.
#[derive(Debug, Clone)]
pub struct TrackContext {
    track: Arc<AudioTrack>,
    track_id: u64,
    user_id: UserId,
    guild_id: GuildId,
    split: Option<SplitWindow>,
    resume_ms: u64,
}

impl TrackContext {
    pub fn new(track: AudioTrack, user_id: UserId, guild_id: GuildId) -> Self {
        Self {
            track: Arc::new(track),
            track_id: rand::random(),
            user_id,
            guild_id,
            split: None,
            resume_ms: 0,
        }
    }

    pub fn split(track: AudioTrack, user_id: UserId, guild_id: GuildId, window: SplitWindow) -> Self {
        let mut context = Self::new(track, user_id, guild_id);
        context.split = Some(window);
        context
    }

    /// Same context, starting `offset_ms` into its effective duration.
    pub fn with_resume_offset(mut self, offset_ms: u64) -> Self {
        self.resume_ms = offset_ms.min(self.effective_duration_ms());
        self
    }

    /// A new context over the same track with a fresh id and no resume offset.
    pub fn make_clone(&self) -> Self {
        Self {
            track: Arc::clone(&self.track),
            track_id: rand::random(),
            user_id: self.user_id,
            guild_id: self.guild_id,
            split: self.split.clone(),
            resume_ms: 0,
        }
    }

    pub fn track(&self) -> &AudioTrack {
        &self.track
    }

    pub fn track_id(&self) -> u64 {
        self.track_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn split_window(&self) -> Option<&SplitWindow> {
        self.split.as_ref()
    }

    pub fn is_stream(&self) -> bool {
        self.track.info.is_stream
    }

    pub fn effective_title(&self) -> &str {
        match &self.split {
            Some(window) => &window.title,
            None => &self.track.info.title,
        }
    }

    pub fn effective_duration_ms(&self) -> u64 {
        match &self.split {
            Some(window) => window.length_ms(),
            None => self.track.info.length,
        }
    }

    pub fn effective_duration(&self) -> Duration {
        Duration::from_millis(self.effective_duration_ms())
    }

    /// Absolute position in the underlying track where playback begins.
    pub fn start_position_ms(&self) -> u64 {
        self.split.as_ref().map_or(0, |w| w.start_ms) + self.resume_ms
    }

    /// Absolute position where playback must stop, when bounded.
    pub fn end_position_ms(&self) -> Option<u64> {
        self.split.as_ref().map(|w| w.end_ms)
    }

    /// Converts a position within this context into one within the underlying track.
    pub fn absolute_position_ms(&self, relative_ms: u64) -> u64 {
        self.split.as_ref().map_or(0, |w| w.start_ms) + relative_ms.min(self.effective_duration_ms())
    }

    /// Converts an absolute track position into one relative to this context.
    pub fn relative_position_ms(&self, absolute_ms: u64) -> u64 {
        let start = self.split.as_ref().map_or(0, |w| w.start_ms);
        absolute_ms
            .saturating_sub(start)
            .min(self.effective_duration_ms())
    }
}
