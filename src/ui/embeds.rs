use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{
    escape_and_defuse, player::PlayerStatus, queue::RepeatMode, track::TrackContext, MAX_VOLUME,
};
use crate::storage::GuildConfig;

/// Tracks listed per queue page.
pub const QUEUE_PAGE_SIZE: usize = 10;

/// Standard palette for the bot's embeds
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

const STANDARD_FOOTER: &str = "🎵 FredBoat";

/// Everything the queue embed shows, gathered from a player in one go.
#[derive(Debug, Clone)]
pub struct QueueView {
    pub current: Option<TrackContext>,
    /// Queued tracks of the requested page.
    pub upcoming: Vec<TrackContext>,
    /// Queue number of the first entry in `upcoming`.
    pub first_number: usize,
    pub status: PlayerStatus,
    pub total_tracks: usize,
    pub streams: usize,
    pub remaining: Duration,
    pub repeat: RepeatMode,
    pub shuffle: bool,
    pub page: usize,
    pub total_pages: usize,
}

impl QueueView {
    pub fn empty() -> Self {
        Self {
            current: None,
            upcoming: Vec::new(),
            first_number: 1,
            status: PlayerStatus::Stopped,
            total_tracks: 0,
            streams: 0,
            remaining: Duration::ZERO,
            repeat: RepeatMode::Off,
            shuffle: false,
            page: 1,
            total_pages: 1,
        }
    }
}

/// Clamps `page` (1-based) into range and returns it with the index window and page count.
pub fn page_bounds(total: usize, page: usize, per_page: usize) -> (usize, usize, usize, usize) {
    let per_page = per_page.max(1);
    let total_pages = total.div_ceil(per_page).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let end = (start + per_page).min(total);
    (page, start, end, total_pages)
}

pub fn now_playing_embed(context: &TrackContext, position_ms: u64, status: PlayerStatus) -> CreateEmbed {
    let info = &context.track().info;
    let status_emoji = match status {
        PlayerStatus::Paused => "⏸️",
        _ => "🎵",
    };

    let timing = if context.is_stream() {
        "🔴 Live".to_string()
    } else {
        let duration = context.effective_duration();
        let position = Duration::from_millis(position_ms).min(duration);
        format!(
            "{} `{} / {}`",
            progress_bar(position, duration),
            format_duration(position),
            format_duration(duration)
        )
    };

    let mut embed = CreateEmbed::default()
        .title(format!("{} Now Playing", status_emoji))
        .description(format!("**{}**", escape_and_defuse(context.effective_title())))
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Author", escape_and_defuse(&info.author), true)
        .field("👤 Requested by", format!("<@{}>", context.user_id()), true)
        .field("⏱️ Progress", timing, false);

    if context.split_window().is_some() {
        embed = embed.field("📑 Part of", escape_and_defuse(&info.title), false);
    }
    if let Some(artwork) = &info.artwork_url {
        embed = embed.thumbnail(artwork);
    }
    if let Some(uri) = &info.uri {
        embed = embed.url(uri);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn track_added_embed(context: &TrackContext, queue_position: usize) -> CreateEmbed {
    let info = &context.track().info;
    let duration = if context.is_stream() {
        "🔴 Live".to_string()
    } else {
        format_duration(context.effective_duration())
    };

    let mut embed = CreateEmbed::default()
        .title("✅ Track Added")
        .description(format!("**{}** was added to the queue", escape_and_defuse(context.effective_title())))
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Author", escape_and_defuse(&info.author), true)
        .field("⏱️ Duration", duration, true)
        .field("📍 Position", queue_position.to_string(), true);

    if let Some(artwork) = &info.artwork_url {
        embed = embed.thumbnail(artwork);
    }
    if let Some(uri) = &info.uri {
        embed = embed.url(uri);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("🎵 Playback starts automatically when nothing is playing"))
}

pub fn playlist_added_embed(name: &str, track_count: usize, split: bool) -> CreateEmbed {
    let title = if split { "📑 Chapters Added" } else { "📋 Playlist Added" };
    let noun = if track_count == 1 { "track" } else { "tracks" };

    CreateEmbed::default()
        .title(title)
        .description(format!(
            "Added **{}** {} from **{}** to the queue",
            track_count,
            noun,
            escape_and_defuse(name)
        ))
        .color(colors::MUSIC_PURPLE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("🎵 Use /queue to see every track"))
}

pub fn queue_embed(view: &QueueView) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Queue")
        .color(colors::INFO_BLUE);

    if view.current.is_none() && view.upcoming.is_empty() {
        return embed
            .description("😴 **The queue is empty**\n\n💡 Use `/play <song>` to add music")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    if let Some(current) = &view.current {
        let status = match (view.status, view.repeat) {
            (PlayerStatus::Paused, _) => "⏸️",
            (_, RepeatMode::Single) => "🔂",
            (_, RepeatMode::All) => "🔁",
            _ => "▶️",
        };
        embed = embed.field(
            format!("{} Playing", status),
            format!(
                "**{}** - <@{}>",
                escape_and_defuse(current.effective_title()),
                current.user_id()
            ),
            false,
        );
    }

    if !view.upcoming.is_empty() {
        let mut description = String::new();
        for (i, context) in view.upcoming.iter().enumerate() {
            let duration = if context.is_stream() {
                " `[live]`".to_string()
            } else {
                format!(" `[{}]`", format_duration(context.effective_duration()))
            };
            description.push_str(&format!(
                "**{}**. {} - <@{}>{}\n",
                view.first_number + i,
                escape_and_defuse(context.effective_title()),
                context.user_id(),
                duration
            ));
        }
        embed = embed.field("Up next", description, false);
    }

    let mut info = format!("**Total:** {} tracks", view.total_tracks);
    if view.remaining > Duration::ZERO {
        info.push_str(&format!(" • **Remaining:** {}", format_duration(view.remaining)));
    }
    if view.streams > 0 {
        info.push_str(&format!(" • {} live", view.streams));
    }
    if view.shuffle {
        info.push_str(" • 🔀 **Shuffle**");
    }
    if view.repeat != RepeatMode::Off {
        info.push_str(&format!(" • 🔁 **Repeat {}**", view.repeat.label()));
    }
    embed = embed.field("Info", info, false);

    let footer = if view.total_pages > 1 {
        format!("Page {} of {} • FredBoat", view.page, view.total_pages)
    } else {
        STANDARD_FOOTER.to_string()
    };
    embed
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

pub fn volume_embed(volume: f32) -> CreateEmbed {
    let percent = (volume * 100.0).round() as u32;
    let status_emoji = if percent == 0 {
        "🔈"
    } else if percent <= 50 {
        "🔉"
    } else {
        "🔊"
    };

    CreateEmbed::default()
        .title(format!("{} Volume", status_emoji))
        .description(format!("**Volume set to {}%**", percent))
        .field("📊 Level", volume_bar(volume), false)
        .color(colors::INFO_BLUE)
        .footer(CreateEmbedFooter::new("💡 /volume accepts 0 to 150"))
        .timestamp(Timestamp::now())
}

pub fn error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("ℹ️ {}", title))
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn warning_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("⚠️ {}", title))
        .description(description)
        .color(colors::WARNING_ORANGE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// One line per guild setting.
pub fn config_summary(config: &GuildConfig) -> String {
    let flag = |enabled: bool| if enabled { "✅ on" } else { "❌ off" };
    format!(
        "**Track announcements:** {}\n**Auto resume:** {}",
        flag(config.track_announce),
        flag(config.auto_resume)
    )
}

fn volume_bar(volume: f32) -> String {
    let segments = 15;
    let filled = ((volume / MAX_VOLUME).clamp(0.0, 1.0) * segments as f32).round() as usize;
    format!("`[{}{}]`", "█".repeat(filled), "▒".repeat(segments - filled))
}

fn progress_bar(position: Duration, duration: Duration) -> String {
    let segments = 12;
    let ratio = if duration.is_zero() {
        0.0
    } else {
        position.as_secs_f64() / duration.as_secs_f64()
    };
    let marker = ((ratio.clamp(0.0, 1.0) * segments as f64) as usize).min(segments - 1);
    let mut bar = String::new();
    for i in 0..segments {
        bar.push(if i == marker { '🔘' } else { '▬' });
    }
    bar
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
