use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::all::{ConnectionStage, ShardId, ShardManager};
use serenity::model::id::{ChannelId, GuildId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::registry::PlayerRegistry;
use crate::executor::TaskExecutor;
use crate::gateway::shard_id_for;

const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Remembers which voice channels to rejoin after a shard comes back.
pub struct ShardReviveHandler {
    registry: Arc<PlayerRegistry>,
    shard_count: u32,
    channels_to_rejoin: DashMap<u32, Vec<(GuildId, ChannelId)>>,
}

impl ShardReviveHandler {
    pub fn new(registry: Arc<PlayerRegistry>, shard_count: u32) -> Self {
        Self {
            registry,
            shard_count,
            channels_to_rejoin: DashMap::new(),
        }
    }

    /// Records the channels of players currently playing on `shard_id`.
    pub fn on_shard_shutdown(&self, shard_id: u32) -> usize {
        let channels: Vec<(GuildId, ChannelId)> = self
            .registry
            .playing_players()
            .iter()
            .filter(|p| shard_id_for(p.guild_id(), self.shard_count) == shard_id)
            .filter_map(|p| p.current_voice_channel().map(|c| (p.guild_id(), c)))
            .collect();
        let count = channels.len();
        self.channels_to_rejoin.insert(shard_id, channels);
        info!("📝 Remembered {} voice channels of shard {}", count, shard_id);
        count
    }

    /// Rejoins whatever was recorded for `shard_id`, once.
    pub async fn on_shard_ready(&self, shard_id: u32) -> usize {
        let Some((_, channels)) = self.channels_to_rejoin.remove(&shard_id) else {
            return 0;
        };
        let mut rejoined = 0;
        for (guild_id, channel_id) in channels {
            let player = self.registry.get_or_create(guild_id);
            match player.join_channel(channel_id).await {
                Ok(()) => rejoined += 1,
                Err(e) => warn!("Could not rejoin {} in guild {}: {}", channel_id, guild_id, e),
            }
        }
        info!("🔁 Rejoined {} voice channels on shard {}", rejoined, shard_id);
        rejoined
    }
}

/// Restarts a single gateway shard.
#[async_trait]
pub trait ShardController: Send + Sync {
    async fn restart(&self, shard_id: u32);

    async fn is_connected(&self, shard_id: u32) -> bool;
}

#[async_trait]
impl ShardController for ShardManager {
    async fn restart(&self, shard_id: u32) {
        ShardManager::restart(self, ShardId(shard_id)).await;
    }

    async fn is_connected(&self, shard_id: u32) -> bool {
        self.runners
            .lock()
            .await
            .get(&ShardId(shard_id))
            .is_some_and(|runner| runner.stage == ConnectionStage::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviveStatus {
    Started,
    /// A revive is running and was left alone.
    InProgress { running_for: Duration },
    /// A running revive was aborted and replaced.
    Replaced { running_for: Duration },
}

struct RevivalTask {
    handle: JoinHandle<()>,
    started: Instant,
}

/// Runs shard revives on the background executor, at most one per shard.
pub struct ShardReviver {
    controller: Arc<dyn ShardController>,
    handler: Arc<ShardReviveHandler>,
    executor: TaskExecutor,
    connect_timeout: Duration,
    tasks: Mutex<HashMap<u32, RevivalTask>>,
}

impl ShardReviver {
    pub fn new(
        controller: Arc<dyn ShardController>,
        handler: Arc<ShardReviveHandler>,
        executor: TaskExecutor,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            handler,
            executor,
            connect_timeout,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn revive(&self, shard_id: u32, force: bool) -> ReviveStatus {
        let mut tasks = self.tasks.lock();
        let mut status = ReviveStatus::Started;
        if let Some(task) = tasks.get(&shard_id).filter(|t| !t.handle.is_finished()) {
            let running_for = task.started.elapsed();
            if !force {
                info!(
                    "Revive of shard {} already running for {}",
                    shard_id,
                    humantime::format_duration(running_for)
                );
                return ReviveStatus::InProgress { running_for };
            }
            warn!("Force flag set, aborting running revive of shard {}", shard_id);
            task.handle.abort();
            status = ReviveStatus::Replaced { running_for };
        }

        let controller = Arc::clone(&self.controller);
        let handler = Arc::clone(&self.handler);
        let connect_timeout = self.connect_timeout;
        let handle = self.executor.spawn("shard-revive", async move {
            info!("🔧 Reviving shard {}", shard_id);
            handler.on_shard_shutdown(shard_id);
            controller.restart(shard_id).await;

            let deadline = Instant::now() + connect_timeout;
            while !controller.is_connected(shard_id).await {
                if Instant::now() >= deadline {
                    warn!(
                        "⏱️ Shard {} not connected after {}",
                        shard_id,
                        humantime::format_duration(connect_timeout)
                    );
                    return;
                }
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
            debug!("Shard {} reconnected", shard_id);
        });
        tasks.insert(
            shard_id,
            RevivalTask {
                handle,
                started: Instant::now(),
            },
        );
        status
    }

    /// How long the revive of `shard_id` has been running, if one is.
    pub fn in_progress(&self, shard_id: u32) -> Option<Duration> {
        self.tasks
            .lock()
            .get(&shard_id)
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{context, Harness, GUILD};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct SlowShards {
        restarts: AtomicUsize,
        connected: AtomicBool,
    }

    #[async_trait]
    impl ShardController for SlowShards {
        async fn restart(&self, _shard_id: u32) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }

        async fn is_connected(&self, _shard_id: u32) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_rejoins_recorded_channels_once() {
        let harness = Harness::new();
        harness.listener(1, 100);
        let registry = Arc::new(PlayerRegistry::new(harness.services.clone(), 1.0));
        registry.get_or_create(GUILD).queue(context("A", 1)).await.unwrap();
        let handler = ShardReviveHandler::new(Arc::clone(&registry), 1);

        assert_eq!(handler.on_shard_shutdown(0), 1);
        harness.backend.disconnect(GUILD);

        assert_eq!(handler.on_shard_ready(0).await, 1);
        assert_eq!(handler.on_shard_ready(0).await, 0);
        assert_eq!(harness.backend.connects().len(), 2);
        assert_eq!(registry.get_existing(GUILD).unwrap().track_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_revive_is_noop_unless_forced() {
        let harness = Harness::new();
        let registry = Arc::new(PlayerRegistry::new(harness.services.clone(), 1.0));
        let handler = Arc::new(ShardReviveHandler::new(registry, 1));
        let shards = Arc::new(SlowShards {
            restarts: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        });
        let executor = TaskExecutor::new();
        let reviver = ShardReviver::new(
            Arc::clone(&shards) as Arc<dyn ShardController>,
            handler,
            executor.clone(),
            Duration::from_secs(60),
        );

        assert_eq!(reviver.revive(0, false), ReviveStatus::Started);
        assert!(matches!(reviver.revive(0, false), ReviveStatus::InProgress { .. }));
        assert!(matches!(reviver.revive(0, true), ReviveStatus::Replaced { .. }));
        assert!(reviver.in_progress(0).is_some());

        shards.connected.store(true, Ordering::SeqCst);
        executor.shutdown(Duration::from_secs(5)).await;
        assert!(reviver.in_progress(0).is_none());
        assert!(shards.restarts.load(Ordering::SeqCst) >= 1);
    }
}
