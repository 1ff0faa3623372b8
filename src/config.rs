use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Deployment flavour of the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Distribution {
    Development,
    Patron,
    Music,
    Selfhosted,
}

impl Distribution {
    /// The public music distribution keeps volume fixed.
    pub fn volume_supported(self) -> bool {
        self != Distribution::Music
    }
}

impl FromStr for Distribution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEVELOPMENT" | "DEV" => Ok(Distribution::Development),
            "PATRON" => Ok(Distribution::Patron),
            "MUSIC" => Ok(Distribution::Music),
            "SELFHOSTED" | "SELF_HOSTED" => Ok(Distribution::Selfhosted),
            other => anyhow::bail!("Unknown distribution: {}", other),
        }
    }
}

/// One relay node, configured as `name|ws://host:port|password`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNodeConfig {
    pub name: String,
    pub ws_url: String,
    pub password: String,
}

impl FromStr for RelayNodeConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(ws_url), Some(password)) if !name.is_empty() => {
                let parsed = url::Url::parse(ws_url)?;
                if !matches!(parsed.scheme(), "ws" | "wss") {
                    anyhow::bail!("Relay node {} must use ws:// or wss://", name);
                }
                Ok(Self {
                    name: name.to_string(),
                    ws_url: ws_url.trim_end_matches('/').to_string(),
                    password: password.to_string(),
                })
            }
            _ => anyhow::bail!("Relay node entry must look like name|ws://host:port|password"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // dev command registration
    pub shard_count: u32,
    pub distribution: Distribution,
    pub bot_admins: Vec<u64>,

    // Audio
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub player_limit: i64, // -1 = unlimited
    pub lavalink_hosts: Vec<RelayNodeConfig>,

    // Paths
    pub data_dir: PathBuf,
    pub music_persistence_dir: PathBuf,

    // Restart handling
    pub persistence_shard_limit: u32,
    pub shutdown_announce_timeout: Duration,
    pub shard_revive_timeout: Duration,
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    };
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let lavalink_hosts = std::env::var("LAVALINK_HOSTS")
            .unwrap_or_default()
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<RelayNodeConfig>>>()?;

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),
            shard_count: env_or("SHARD_COUNT", "1")?,
            distribution: std::env::var("DISTRIBUTION")
                .unwrap_or_else(|_| "SELFHOSTED".to_string())
                .parse()?,
            bot_admins: std::env::var("BOT_ADMINS")
                .unwrap_or_default()
                .split(',')
                .filter(|id| !id.trim().is_empty())
                .map(|id| id.trim().parse::<u64>())
                .collect::<std::result::Result<Vec<_>, _>>()?,

            // Audio
            default_volume: env_or("DEFAULT_VOLUME", "1.0")?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", "10000")?,
            player_limit: env_or("PLAYER_LIMIT", "-1")?,
            lavalink_hosts,

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
            music_persistence_dir: std::env::var("MUSIC_PERSISTENCE_DIR")
                .unwrap_or_else(|_| "music_persistence".to_string())
                .into(),

            // Restart handling
            persistence_shard_limit: env_or("PERSISTENCE_SHARD_LIMIT", "10")?,
            shutdown_announce_timeout: Duration::from_secs(env_or(
                "SHUTDOWN_ANNOUNCE_TIMEOUT_SECS",
                "30",
            )?),
            shard_revive_timeout: Duration::from_secs(env_or("SHARD_REVIVE_TIMEOUT_SECS", "60")?),
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that catch common deployment mistakes.
    ///
    /// - Volume must be within `0.0..=1.5`
    /// - Shard count and queue size must be positive
    /// - Player limit is either `-1` or a non-negative count
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=crate::audio::MAX_VOLUME).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and {}, got: {}",
                crate::audio::MAX_VOLUME,
                self.default_volume
            );
        }

        if self.shard_count == 0 {
            anyhow::bail!("Shard count must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.player_limit < -1 {
            anyhow::bail!("Player limit must be -1 (unlimited) or >= 0, got: {}", self.player_limit);
        }

        if self.shutdown_announce_timeout.is_zero() {
            anyhow::bail!("Shutdown announcement timeout must be greater than 0");
        }

        Ok(())
    }

    pub fn is_bot_admin(&self, user_id: u64) -> bool {
        self.bot_admins.contains(&user_id)
    }

    pub fn is_local_playback(&self) -> bool {
        self.lavalink_hosts.is_empty()
    }

    /// Token-free one-liner for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {}), {} shard(s), {:?}\n  \
            Audio: {}% vol, queue {} max, player limit {}\n  \
            Playback: {}\n  \
            Persistence: {} (shard limit {}, notice timeout {})",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.shard_count,
            self.distribution,
            (self.default_volume * 100.0) as u32,
            self.max_queue_size,
            if self.player_limit < 0 {
                "unlimited".to_string()
            } else {
                self.player_limit.to_string()
            },
            if self.is_local_playback() {
                "local (songbird)".to_string()
            } else {
                format!(
                    "relay nodes [{}]",
                    self.lavalink_hosts
                        .iter()
                        .map(|n| n.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            },
            self.music_persistence_dir.display(),
            self.persistence_shard_limit,
            humantime::format_duration(self.shutdown_announce_timeout),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,
            shard_count: 1,
            distribution: Distribution::Selfhosted,
            bot_admins: Vec::new(),

            default_volume: 1.0,
            max_queue_size: 10_000,
            player_limit: -1,
            lavalink_hosts: Vec::new(),

            data_dir: "./data".into(),
            music_persistence_dir: "music_persistence".into(),

            persistence_shard_limit: 10,
            shutdown_announce_timeout: Duration::from_secs(30),
            shard_revive_timeout: Duration::from_secs(60),
        }
    }
}
