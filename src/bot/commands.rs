use anyhow::Result;
use regex::Regex;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId, Permissions},
    prelude::Context,
};
use std::time::Duration;

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        voteskip_command(),
        stop_command(),
        leave_command(),
        queue_command(),
        nowplaying_command(),
        volume_command(),
        repeat_command(),
        shuffle_command(),
        reshuffle_command(),
        seek_command(),
        config_command(),
        revive_command(),
    ]
}

/// Registers global commands
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }
    Ok(())
}

/// Registers commands for a single guild (development)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

// Playback

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Plays a track or playlist")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
                .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "split",
            "Queue the chapters of the video as separate tracks",
        ))
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pauses the player")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Resumes the player")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip")
        .description("Skips the current track, a queue position or a range like 2-5")
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "tracks",
            "Position n or range n-m, 1 is the current track",
        ))
}

fn voteskip_command() -> CreateCommand {
    CreateCommand::new("voteskip").description("Votes to skip the current track")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Stops the player and clears the queue")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Leaves the voice channel and keeps the queue")
}

// Queue

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Shows the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number").min_int_value(1),
        )
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Shows the current track")
}

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Shows or changes the volume")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "level", "Volume in percent (0-150)")
                .min_int_value(0)
                .max_int_value(150),
        )
}

fn repeat_command() -> CreateCommand {
    CreateCommand::new("repeat")
        .description("Sets the repeat mode")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Repeat mode")
                .add_string_choice("Off", "off")
                .add_string_choice("Single track", "single")
                .add_string_choice("Whole queue", "all")
                .required(true),
        )
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Toggles shuffle")
}

fn reshuffle_command() -> CreateCommand {
    CreateCommand::new("reshuffle").description("Shuffles the queue again")
}

fn seek_command() -> CreateCommand {
    CreateCommand::new("seek")
        .description("Jumps to a position in the current track")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "position",
                "Timestamp like 1:30, 01:02:03 or 2m10s",
            )
            .required(true),
        )
}

// Administration

fn config_command() -> CreateCommand {
    CreateCommand::new("config")
        .description("Shows or changes the music settings of this server")
        .default_member_permissions(Permissions::MANAGE_GUILD)
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "announce",
            "Announce every track that starts playing",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "auto_resume",
            "Resume a paused player when someone joins its voice channel",
        ))
}

fn revive_command() -> CreateCommand {
    CreateCommand::new("revive")
        .description("Restarts a gateway shard (bot admins only)")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "shard", "Shard id")
                .min_int_value(0)
                .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "force",
            "Replace a revive that is already running",
        ))
}

/// Parses `90`, `1:30`, `01:02:03` or a humantime string like `2m10s` into milliseconds.
pub fn parse_timestamp(input: &str) -> Option<u64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let clock = Regex::new(r"^(?:(\d+):)?(?:(\d+):)?(\d+)$").ok()?;
    if let Some(captures) = clock.captures(input) {
        let mut seconds: u64 = 0;
        for part in captures.iter().skip(1).flatten() {
            seconds = seconds.checked_mul(60)?.checked_add(part.as_str().parse().ok()?)?;
        }
        return seconds.checked_mul(1000);
    }

    humantime::parse_duration(input)
        .ok()
        .map(|d: Duration| d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackRangeError {
    NumberTooLow,
    InvalidRange,
    Malformed,
}

impl std::fmt::Display for TrackRangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackRangeError::NumberTooLow => write!(f, "Track numbers start at 1."),
            TrackRangeError::InvalidRange => write!(f, "The end of the range must not be before its start."),
            TrackRangeError::Malformed => write!(f, "Use a position like `3` or a range like `2-5`."),
        }
    }
}

/// Parses `n` or `n-m` into an inclusive 1-based range.
pub fn parse_track_range(input: &str) -> Result<(usize, usize), TrackRangeError> {
    let range = Regex::new(r"^\s*(\d+)\s*(?:-\s*(\d+)\s*)?$").map_err(|_| TrackRangeError::Malformed)?;
    let captures = range.captures(input).ok_or(TrackRangeError::Malformed)?;
    let number = |index: usize| -> Result<Option<usize>, TrackRangeError> {
        captures
            .get(index)
            .map(|m| m.as_str().parse().map_err(|_| TrackRangeError::Malformed))
            .transpose()
    };
    let start = number(1)?.ok_or(TrackRangeError::Malformed)?;
    let end = number(2)?.unwrap_or(start);
    if start < 1 {
        return Err(TrackRangeError::NumberTooLow);
    }
    if end < start {
        return Err(TrackRangeError::InvalidRange);
    }
    Ok((start, end))
}
