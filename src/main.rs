use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod config;
mod executor;
mod gateway;
mod storage;
mod ui;

use crate::audio::{
    connection::{AudioBackend, AudioConnectionFacade},
    persistence::{ExitCode, MusicPersistence, PersistenceSettings},
    player::PlayerServices,
    registry::PlayerRegistry,
    relay::RelayPool,
    revive::{ShardController, ShardReviveHandler, ShardReviver},
    text_channel::MusicTextChannelProvider,
};
use crate::bot::FredBoatBot;
use crate::config::Config;
use crate::executor::TaskExecutor;
use crate::gateway::SerenityGateway;
use crate::storage::JsonStorage;

/// How long background tasks get to finish once the gateway is down.
const EXECUTOR_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fredboat=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting FredBoat v{}", env!("CARGO_PKG_VERSION"));

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);
    let gateway = Arc::new(SerenityGateway::new());
    let songbird = Songbird::serenity();
    let executor = TaskExecutor::new();

    let http = reqwest::Client::new();
    let backend = if config.is_local_playback() {
        info!("🎼 Local playback through songbird");
        AudioBackend::Local
    } else {
        info!("🎼 Playback through {} relay node(s)", config.lavalink_hosts.len());
        AudioBackend::Remote(Arc::new(RelayPool::new(&config.lavalink_hosts, http.clone())?))
    };
    let facade = Arc::new(AudioConnectionFacade::new(Arc::clone(&songbird), http, backend));

    let services = PlayerServices {
        facade,
        gateway: Arc::clone(&gateway) as _,
        guild_config: Arc::clone(&storage) as _,
        text_channels: Arc::new(MusicTextChannelProvider::new()),
        max_queue_size: config.max_queue_size,
    };
    let registry = Arc::new(PlayerRegistry::new(services, config.default_volume));
    let persistence = Arc::new(MusicPersistence::new(
        Arc::clone(&registry),
        PersistenceSettings {
            dir: config.music_persistence_dir.clone(),
            distribution: config.distribution,
            shard_limit: config.persistence_shard_limit,
            announce_timeout: config.shutdown_announce_timeout,
        },
    ));
    let revive_handler = Arc::new(ShardReviveHandler::new(Arc::clone(&registry), config.shard_count));

    let bot = Arc::new(FredBoatBot::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&storage),
        Arc::clone(&persistence),
        Arc::clone(&revive_handler),
        executor.clone(),
    ));

    // Members are needed for moderator checks and human listener counts.
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES | GatewayIntents::GUILD_MEMBERS;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler_arc(Arc::clone(&bot))
        .register_songbird_with(songbird)
        .await?;

    gateway.bind(Arc::clone(&client.cache), Arc::clone(&client.http));
    let shard_manager = Arc::clone(&client.shard_manager);
    bot.attach_reviver(Arc::new(ShardReviver::new(
        Arc::clone(&shard_manager) as Arc<dyn ShardController>,
        revive_handler,
        executor.clone(),
        config.shard_revive_timeout,
    )));

    let shutdown = tokio::spawn(async move {
        let exit_code = wait_for_shutdown_signal().await;
        info!("⚠️ Shutdown requested ({:?}), saving players...", exit_code);
        persistence.pre_shutdown(exit_code).await;
        shard_manager.shutdown_all().await;
        exit_code
    });

    info!("🚀 Connecting {} shard(s)", config.shard_count);
    if let Err(why) = client.start_shards(config.shard_count).await {
        error!("Client error: {:?}", why);
    }

    let exit_code = if shutdown.is_finished() {
        shutdown.await.unwrap_or(ExitCode::Error)
    } else {
        shutdown.abort();
        ExitCode::Error
    };

    executor.shutdown(EXECUTOR_GRACE).await;
    storage.close().await?;
    info!("👋 FredBoat stopped with exit code {}", exit_code.code());

    if exit_code != ExitCode::Normal {
        std::process::exit(exit_code.code());
    }
    Ok(())
}

/// Ctrl+C and SIGTERM stop the bot; SIGHUP asks the supervisor for a restart.
async fn wait_for_shutdown_signal() -> ExitCode {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                return tokio::select! {
                    _ = ctrl_c() => ExitCode::Normal,
                    _ = term.recv() => ExitCode::Normal,
                    _ = hup.recv() => ExitCode::Restart,
                };
            }
            _ => warn!("Could not install unix signal handlers, only Ctrl+C stops the bot"),
        }
    }

    ctrl_c().await;
    ExitCode::Normal
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error registering Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn health_check() -> Result<()> {
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing yt-dlp or ffmpeg");
    }
}
