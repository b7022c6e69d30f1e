use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use encore_core::{init_logging, AppDirs, Config, RpcConfig, ValidationError};
use encore_extension::{
    ExtensionHost, ExtensionManifest, InMemoryNotifications, InMemoryPlayback, InProcessExtension,
    PingHost, PlaybackChanged, PlaybackControl, PlaybackState, PlayerAction, PlayerCommand,
    PostNotification, TrackInfo,
};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEMO_SCENE: &str = "main";
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "encore", version, about = "Extension host for the Encore music player")]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a host with in-process extensions over loopback channels (default)
    Demo(DemoCommand),
    /// Print the resolved directories
    Paths,
}

#[derive(Debug, Parser, Clone, Default)]
struct DemoCommand {
    /// Extension id to attach; repeat for several (overrides rpc.extension_ids)
    #[arg(long = "extension")]
    extensions: Vec<String>,
    /// Skip the ping sent right after an extension attaches
    #[arg(long)]
    no_eager_ping: bool,
}

#[derive(Debug, Error)]
enum DemoError {
    #[error("demo needs at least one extension id")]
    NoExtensions,
    #[error("{0}")]
    Invalid(#[from] ValidationError),
}

impl DemoCommand {
    /// Connection settings for the demo: config values with CLI overrides
    /// applied.
    fn rpc_config(&self, config: &Config) -> Result<RpcConfig, DemoError> {
        let mut effective = config.clone();
        if !self.extensions.is_empty() {
            effective.rpc.extension_ids = self.extensions.clone();
        }
        if self.no_eager_ping {
            effective.rpc.eager_ping = false;
        }
        if effective.rpc.extension_ids.is_empty() {
            return Err(DemoError::NoExtensions);
        }
        effective.validate()?;
        Ok(effective.rpc)
    }
}

/// What one demo session exercised.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DemoReport {
    extensions: usize,
    notifications: usize,
    player_commands: usize,
    events_delivered: usize,
    events_received: usize,
}

fn demo_queue() -> Vec<TrackInfo> {
    [
        ("t-1", "Overture", "The Openers"),
        ("t-2", "Second Verse", "The Openers"),
        ("t-3", "Curtain Call", "Finale"),
    ]
    .into_iter()
    .map(|(id, title, artist)| TrackInfo {
        id: id.to_string(),
        title: title.to_string(),
        artist: artist.to_string(),
        album: Some("Encore Sampler".to_string()),
        duration_seconds: Some(180),
        artwork: None,
    })
    .collect()
}

async fn run_demo(rpc: &RpcConfig, dirs: &AppDirs) -> Result<DemoReport> {
    let notifications = Arc::new(InMemoryNotifications::new());
    let playback = Arc::new(InMemoryPlayback::with_queue(demo_queue()));
    let host = ExtensionHost::new(rpc, notifications.clone(), playback.clone());
    let wait = rpc.wait_for_connection;

    let mut report = DemoReport::default();
    let mut attached = Vec::new();

    for id in &rpc.extension_ids {
        let manifest = ExtensionManifest::load_or_builtin(dirs.extensions_dir(), id)?;
        let extension = InProcessExtension::connect(&host, manifest)
            .await
            .with_context(|| format!("failed to attach extension '{id}'"))?;
        report.extensions += 1;

        let pong = extension
            .main()
            .dispatch(&PingHost { sent_at: Utc::now() }, wait)
            .await?;
        tracing::info!(
            extension = %id,
            round_trip_ms = (pong.received_at - pong.sent_at).num_milliseconds(),
            "host answered ping"
        );

        let notification = PostNotification {
            title: format!("{} is ready", extension.manifest().name),
            body: format!("version {}", extension.manifest().version),
            artwork: None,
        };
        match extension.main().dispatch(&notification, wait).await {
            Ok(posted) => {
                report.notifications += 1;
                tracing::info!(extension = %id, notification = %posted.id, "notification posted");
            }
            Err(err) => tracing::warn!(extension = %id, error = %err, "notification refused"),
        }

        let scene = extension.open_scene(&host, DEMO_SCENE)?;
        let events = scene.receive::<PlaybackChanged>();
        match scene
            .dispatch(&PlayerCommand { action: PlayerAction::Play }, wait)
            .await
        {
            Ok(status) => {
                report.player_commands += 1;
                tracing::info!(extension = %id, state = %status.state, "player command applied");
            }
            Err(err) => tracing::warn!(extension = %id, error = %err, "player command refused"),
        }

        attached.push((extension, events));
    }

    let now = playback.now_playing().await;
    let event = PlaybackChanged {
        state: now
            .as_ref()
            .map(|playing| playing.state.clone())
            .unwrap_or(PlaybackState::Stopped),
        position_seconds: now.as_ref().map_or(0, |playing| playing.position_seconds),
        track: now.map(|playing| playing.track),
        at: Utc::now(),
    };
    report.events_delivered = host.broadcast_playback(&event).await;

    for (extension, mut events) in attached {
        match tokio::time::timeout(EVENT_TIMEOUT, events.next()).await {
            Ok(Some(received)) => {
                report.events_received += 1;
                tracing::info!(extension = %extension.id(), state = %received.state, "scene saw playback change");
            }
            Ok(None) | Err(_) => {
                tracing::warn!(extension = %extension.id(), "scene saw no playback change")
            }
        }
    }

    tracing::debug!(posted = notifications.posted().len(), "notification center drained");
    Ok(report)
}

fn print_paths(dirs: &AppDirs, config_path: &std::path::Path) {
    println!("config file: {}", config_path.display());
    println!("config dir:  {}", dirs.config_dir().display());
    println!("data dir:    {}", dirs.data_dir().display());
    println!("cache dir:   {}", dirs.cache_dir().display());
    println!("log dir:     {}", dirs.log_dir().display());
    println!("extensions:  {}", dirs.extensions_dir().display());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let (config, config_path) = match &cli.config {
        Some(path) => (Config::load_from(path)?, path.clone()),
        None => (Config::load_or_default(&dirs)?, Config::config_path(&dirs)),
    };
    let _logging = init_logging(&config.logging, &dirs)?;

    match cli.command.unwrap_or(Command::Demo(DemoCommand::default())) {
        Command::Paths => print_paths(&dirs, &config_path),
        Command::Demo(demo) => {
            let rpc = demo.rpc_config(&config)?;
            tracing::info!(extensions = ?rpc.extension_ids, eager_ping = rpc.eager_ping, "starting demo host");
            let report = run_demo(&rpc, &dirs).await?;
            println!(
                "Attached {} extension(s): {} notification(s), {} player command(s), playback change seen by {}/{} scene(s)",
                report.extensions,
                report.notifications,
                report.player_commands,
                report.events_received,
                report.events_delivered
            );
        }
    }

    Ok(())
}
