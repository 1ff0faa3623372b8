use serde::Deserialize;
use serenity::model::id::{GuildId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::audio::{
    codec::{AudioTrack, TrackInfo},
    connection::AudioConnectionFacade,
    error::PlayerError,
    relay::LoadResult,
    track::{SplitWindow, TrackContext},
};

const YTDLP_TIMEOUT: Duration = Duration::from_secs(30);
const FIELD_SEPARATOR: char = '\t';
const YTDLP_FORMAT: &str =
    "%(webpage_url)s\t%(id)s\t%(title)s\t%(uploader)s\t%(duration)s\t%(is_live)s\t%(thumbnail)s\t%(extractor_key)s";

/// What an identifier resolved to.
#[derive(Debug, Clone)]
pub enum LoadedItem {
    Track(AudioTrack),
    Playlist { name: String, tracks: Vec<AudioTrack> },
}

impl LoadedItem {
    pub fn tracks(&self) -> Vec<&AudioTrack> {
        match self {
            LoadedItem::Track(track) => vec![track],
            LoadedItem::Playlist { tracks, .. } => tracks.iter().collect(),
        }
    }
}

/// Resolves URLs and search queries into tracks using the active backend.
pub struct AudioLoader {
    facade: Arc<AudioConnectionFacade>,
}

impl AudioLoader {
    pub fn new(facade: Arc<AudioConnectionFacade>) -> Self {
        Self { facade }
    }

    pub async fn load(&self, identifier: &str) -> Result<LoadedItem, PlayerError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(PlayerError::NoMatches(String::new()));
        }
        info!("🔍 Loading {}", identifier);

        match self.facade.relay() {
            Some(pool) => {
                let result = pool.load_tracks(&relay_identifier(identifier)).await?;
                from_load_result(identifier, result)
            }
            None => self.load_local(identifier).await,
        }
    }

    /// Carves one track into contexts, one per window.
    pub fn split(
        track: &AudioTrack,
        user_id: UserId,
        guild_id: GuildId,
        windows: Vec<SplitWindow>,
    ) -> Vec<TrackContext> {
        windows
            .into_iter()
            .filter(|w| w.length_ms() > 0)
            .map(|w| TrackContext::split(track.clone(), user_id, guild_id, w))
            .collect()
    }

    /// Chapter windows of a track as reported by yt-dlp. Empty when the
    /// track has none or the relay backend is active.
    pub async fn chapters(&self, track: &AudioTrack) -> Vec<SplitWindow> {
        if !self.facade.is_local() || track.info.is_stream {
            return Vec::new();
        }
        let output = match run_ytdlp(&["--skip-download", "--print", "%(chapters)j", track.locator()]).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Could not read chapters of {}: {}", track.info.title, e);
                return Vec::new();
            }
        };
        parse_chapters(output.trim(), track.info.length)
    }

    async fn load_local(&self, identifier: &str) -> Result<LoadedItem, PlayerError> {
        let is_url = is_url(identifier);
        let target = if is_url {
            identifier.to_string()
        } else {
            format!("ytsearch1:{identifier}")
        };
        let output = run_ytdlp(&[
            "--flat-playlist",
            "--skip-download",
            "--quiet",
            "--no-warnings",
            "--print",
            YTDLP_FORMAT,
            &target,
        ])
        .await?;

        let tracks: Vec<AudioTrack> = output
            .lines()
            .filter_map(|line| match parse_ytdlp_line(line) {
                Some(info) => Some(AudioTrack::from_info(info)),
                None => {
                    debug!("Skipping unparsable yt-dlp line: {}", line);
                    None
                }
            })
            .collect();

        match tracks.len() {
            0 => Err(PlayerError::NoMatches(identifier.to_string())),
            1 if !is_url || !looks_like_playlist(identifier) => {
                Ok(LoadedItem::Track(tracks.into_iter().next().ok_or_else(|| {
                    PlayerError::NoMatches(identifier.to_string())
                })?))
            }
            _ => Ok(LoadedItem::Playlist {
                name: identifier.to_string(),
                tracks,
            }),
        }
    }
}

fn is_url(identifier: &str) -> bool {
    Url::parse(identifier).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

fn looks_like_playlist(identifier: &str) -> bool {
    Url::parse(identifier).is_ok_and(|u| u.query_pairs().any(|(k, _)| k == "list"))
}

/// URLs pass through untouched; anything else becomes a YouTube search.
fn relay_identifier(identifier: &str) -> String {
    if is_url(identifier) {
        identifier.to_string()
    } else {
        format!("ytsearch:{identifier}")
    }
}

fn from_load_result(identifier: &str, result: LoadResult) -> Result<LoadedItem, PlayerError> {
    match result {
        LoadResult::Track(track) => Ok(LoadedItem::Track(track)),
        LoadResult::Playlist(playlist) if playlist.tracks.is_empty() => {
            Err(PlayerError::NoMatches(identifier.to_string()))
        }
        LoadResult::Playlist(playlist) => Ok(LoadedItem::Playlist {
            name: playlist.info.name,
            tracks: playlist.tracks,
        }),
        LoadResult::Search(tracks) => tracks
            .into_iter()
            .next()
            .map(LoadedItem::Track)
            .ok_or_else(|| PlayerError::NoMatches(identifier.to_string())),
        LoadResult::Empty(_) => Err(PlayerError::NoMatches(identifier.to_string())),
        LoadResult::Error(e) => Err(PlayerError::LoadFailed(
            e.message.unwrap_or_else(|| format!("{} failure", e.severity)),
        )),
    }
}

async fn run_ytdlp(args: &[&str]) -> Result<String, PlayerError> {
    let mut cmd = Command::new("yt-dlp");
    cmd.args(["--socket-timeout", "15", "--retries", "2"]).args(args);
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(YTDLP_TIMEOUT, cmd.output())
        .await
        .map_err(|_| PlayerError::Backend("yt-dlp timed out".into()))?
        .map_err(|e| PlayerError::Backend(format!("could not run yt-dlp: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("yt-dlp failed: {}", stderr.trim());
        return Err(PlayerError::LoadFailed(
            stderr.lines().last().unwrap_or("yt-dlp failed").to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn field(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != "NA").then(|| value.to_string())
}

/// Parses one line printed with the loader's yt-dlp output template.
fn parse_ytdlp_line(line: &str) -> Option<TrackInfo> {
    let parts: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if parts.len() < 8 {
        return None;
    }
    let uri = field(parts[0])?;
    let duration = field(parts[4]).and_then(|d| d.parse::<f64>().ok());
    let is_live = parts[5].trim() == "True";

    Some(TrackInfo {
        identifier: field(parts[1]).unwrap_or_else(|| uri.clone()),
        title: field(parts[2]).unwrap_or_else(|| "Unknown title".into()),
        author: field(parts[3]).unwrap_or_else(|| "Unknown artist".into()),
        length: duration.map_or(0, |secs| (secs * 1000.0) as u64),
        is_stream: is_live || duration.is_none(),
        uri: Some(uri),
        artwork_url: field(parts[6]),
        isrc: None,
        source_name: field(parts[7]).map_or_else(|| "http".into(), |s| s.to_lowercase()),
        position: 0,
    })
}

#[derive(Debug, Deserialize)]
struct Chapter {
    start_time: f64,
    end_time: f64,
    title: String,
}

fn parse_chapters(json: &str, length_ms: u64) -> Vec<SplitWindow> {
    let Ok(chapters) = serde_json::from_str::<Vec<Chapter>>(json) else {
        return Vec::new();
    };
    chapters
        .into_iter()
        .map(|c| {
            let start = (c.start_time * 1000.0) as u64;
            let end = ((c.end_time * 1000.0) as u64).min(length_ms.max(start));
            SplitWindow::new(c.title, start, end)
        })
        .collect()
}
