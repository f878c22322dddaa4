use std::fs::File;
use std::io::Read as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::info;
use tokio::sync::{broadcast, watch};

mod api;
mod channel;
mod classify;
mod config;
mod messages;
mod presence;

#[derive(Parser, Debug)]
#[command(about = "Presence monitor for cloud-connected relay devices")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut file = File::open(&args.config)
        .with_context(|| format!("opening {}", args.config.display()))?;
    let mut config_contents = String::new();
    file.read_to_string(&mut config_contents)?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)?;

    let devices = config.devices.clone().unwrap_or_default();
    println!("Devices: {:?}", devices);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = channel::ChannelManager::new(config.channel.clone(), shutdown_rx);

    let classifier =
        classify::Classifier::new(config.log.clone().unwrap_or_default().capacity());
    let (events_tx, events_rx) = broadcast::channel(64);
    let classifier_handle = tokio::spawn(classifier.run(manager.subscribe(), events_tx));

    let command_api = api::CommandApi::new(&config.api.base_url);
    let answer_timeout = Duration::from_millis(
        config
            .presence
            .clone()
            .unwrap_or_default()
            .answer_timeout_ms(),
    );
    let (tracker, cmd_tx) = presence::PresenceTracker::new(
        command_api,
        answer_timeout,
        manager.subscribe(),
        events_rx,
    );
    let mut updates = tracker.updates();
    let tracker_handle = tokio::spawn(tracker.run());

    for device in devices {
        cmd_tx.send(presence::Command::Track(device)).await?;
    }

    let manager_handle = tokio::spawn(manager.run());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(update) => println!("{}: {:?}", update.device_id, update.status),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    shutdown_tx.send(true)?;
    drop(cmd_tx);
    manager_handle.await?;
    tracker_handle.await?;
    classifier_handle.await?;

    Ok(())
}
