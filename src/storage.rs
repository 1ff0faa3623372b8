use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

/// Per-guild settings stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildConfig {
    pub guild_id: u64,
    #[serde(default = "default_true")]
    pub track_announce: bool,
    #[serde(default)]
    pub auto_resume: bool,
}

fn default_true() -> bool {
    true
}

impl GuildConfig {
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            track_announce: true,
            auto_resume: false,
        }
    }
}

/// Guild settings consulted by the audio core.
#[cfg_attr(test, mockall::automock)]
pub trait GuildConfigService: Send + Sync {
    fn track_announce(&self, guild_id: GuildId) -> bool;
    fn auto_resume(&self, guild_id: GuildId) -> bool;
}

/// Guild settings under `<data_dir>/servers/guild_<id>.json`, cached in memory.
pub struct JsonStorage {
    data_dir: PathBuf,
    guilds: DashMap<u64, GuildConfig>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(data_dir.join("servers")).await?;
        info!("📁 Storage initialised at {}", data_dir.display());

        let storage = Self {
            data_dir,
            guilds: DashMap::new(),
        };
        storage.load_all().await?;
        Ok(storage)
    }

    /// Cached config for a guild, or the defaults when none was ever saved.
    pub fn get(&self, guild_id: GuildId) -> GuildConfig {
        self.guilds
            .get(&guild_id.get())
            .map(|entry| entry.clone())
            .unwrap_or_else(|| GuildConfig::new(guild_id.get()))
    }

    pub async fn update(&self, config: GuildConfig) -> Result<()> {
        self.save(&config).await?;
        info!("💾 Config updated for guild {}", config.guild_id);
        self.guilds.insert(config.guild_id, config);
        Ok(())
    }

    pub async fn set_track_announce(&self, guild_id: GuildId, enabled: bool) -> Result<()> {
        let mut config = self.get(guild_id);
        config.track_announce = enabled;
        self.update(config).await
    }

    pub async fn set_auto_resume(&self, guild_id: GuildId, enabled: bool) -> Result<()> {
        let mut config = self.get(guild_id);
        config.auto_resume = enabled;
        self.update(config).await
    }

    /// Writes every cached config back to disk.
    pub async fn close(&self) -> Result<()> {
        let configs: Vec<GuildConfig> = self.guilds.iter().map(|e| e.value().clone()).collect();
        for config in &configs {
            if let Err(e) = self.save(config).await {
                warn!("Could not flush config for guild {}: {}", config.guild_id, e);
            }
        }
        info!("📁 Storage closed ({} guild configs)", configs.len());
        Ok(())
    }

    async fn save(&self, config: &GuildConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        fs::write(self.file_path(config.guild_id), content).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("servers")).await?;
        let mut loaded = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            let parsed = fs::read_to_string(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<GuildConfig>(&raw).map_err(Into::into));
            match parsed {
                Ok(config) => {
                    self.guilds.insert(guild_id, config);
                    loaded += 1;
                }
                Err(e) => warn!("Error loading config for guild {}: {}", guild_id, e),
            }
        }

        if loaded > 0 {
            info!("📂 Loaded {} guild configs", loaded);
        }
        Ok(())
    }

    fn file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("servers")
            .join(format!("guild_{}.json", guild_id))
    }
}

impl GuildConfigService for JsonStorage {
    fn track_announce(&self, guild_id: GuildId) -> bool {
        self.get(guild_id).track_announce
    }

    fn auto_resume(&self, guild_id: GuildId) -> bool {
        self.get(guild_id).auto_resume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_defaults_then_persisted_update() {
        let dir = tempfile::tempdir().unwrap();
        let guild = GuildId::new(77);

        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert!(storage.track_announce(guild));
        assert!(!storage.auto_resume(guild));

        storage.set_auto_resume(guild, true).await.unwrap();
        storage.set_track_announce(guild, false).await.unwrap();

        let reopened = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(
            reopened.get(guild),
            GuildConfig {
                guild_id: 77,
                track_announce: false,
                auto_resume: true,
            }
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("servers")).unwrap();
        std::fs::write(dir.path().join("servers/guild_5.json"), "{ nope").unwrap();

        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(storage.get(GuildId::new(5)), GuildConfig::new(5));
    }
}
