//! # Audio Module
//!
//! Per-guild music playback: queues, players, voice connections and the
//! persistence that carries them across restarts.
//!
//! ## Architecture
//!
//! ### [`registry`] - Player Registry
//! - One [`player::GuildPlayer`] per guild, created on demand
//! - Snapshot queries used by persistence, shard revive and the player limiter
//!
//! ### [`player`] - Guild Player
//! - Owns a [`queue::TrackProvider`] and one backend playback handle
//! - Serializes mutating operations per guild; reacts to start/end/error callbacks
//!
//! ### [`connection`] - Audio Connection Facade
//! - `Local` plays through songbird's driver in-process
//! - `Remote` hands decoding to Lavalink-compatible relay nodes ([`relay`])
//!
//! ### [`persistence`] / [`revive`]
//! - Saves each guild's queue before shutdown and restores it when its shard is ready
//! - Rejoins voice channels after a single shard is rebuilt

pub mod backend;
pub mod codec;
pub mod connection;
pub mod error;
pub mod loader;
pub mod local;
pub mod persistence;
pub mod presence;
pub mod player;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod revive;
pub mod text_channel;
pub mod track;

#[cfg(test)]
pub mod testing;

/// Upper bound for player volume; 1.0 is unity gain.
pub const MAX_VOLUME: f32 = 1.5;

/// Escapes Discord markdown and breaks mentions so titles render verbatim.
pub fn escape_and_defuse(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' | '_' | '`' | '~' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '@' => out.push_str("@\u{200B}"),
            _ => out.push(c),
        }
    }
    out
}
