use std::io::Write as _;
use std::sync::Arc;

use log::{debug, error, info, warn};
use sensor_fleet_lib::commands::{self, FleetCommand};
use sensor_fleet_lib::config::{AppConfig, app_config_dir};
use sensor_fleet_lib::logging::{self, FleetLogger};
use sensor_fleet_lib::state::AppState;
use sensor_fleet_lib::store::{JsonFileStore, MemoryStore, SnapshotStore};
use sensor_fleet_lib::utils::ensure_directory_exists;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const LOG_FILE_NAME: &str = "sensor-fleet.log";

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = match app_config_dir() {
        Ok(dir) => match ensure_directory_exists(&dir).await {
            Ok(()) => Some(dir),
            Err(e) => {
                eprintln!("Config directory unavailable: {}", e);
                None
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            None
        }
    };

    let config = match &config_dir {
        Some(dir) => match AppConfig::load_config(dir).await {
            // Written back so keys added since the last run show up in the file
            Ok(config) => {
                if let Err(e) = config.save_config(dir).await {
                    eprintln!("Failed to write config: {:#}", e);
                }
                config
            }
            Err(e) => {
                eprintln!("Failed to load config, using defaults: {:#}", e);
                AppConfig::default()
            }
        },
        None => AppConfig::default(),
    };

    let level = logging::parse_level(&config.logging.level);
    let log_file = config_dir
        .as_ref()
        .filter(|_| config.logging.file_logging_enabled)
        .map(|dir| dir.join(LOG_FILE_NAME));
    if FleetLogger::init(level, log_file.as_deref()).is_err() {
        // Only fall back to env_logger when our logger could not be installed
        env_logger::builder().filter_level(level).init();
    }

    let store: Arc<dyn SnapshotStore> = match &config_dir {
        Some(dir) => Arc::new(JsonFileStore::in_dir(dir)),
        None => {
            warn!("No config directory, fleet state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    info!("Starting AppState initialization.");
    let state = AppState::new(&config, store).await?;
    let shutdown = CancellationToken::new();

    state.fleet.restore().await;
    let monitor = state.fleet.battery().spawn(shutdown.clone());

    let mut events = state.fleet.subscribe();
    let events_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => debug!("Fleet event: {:?}", event),
                    Err(RecvError::Lagged(skipped)) => warn!("Dropped {} fleet events", skipped),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    println!("{}", commands::HELP);
    prompt();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            prompt();
            continue;
        }
        match line.parse::<FleetCommand>() {
            Ok(FleetCommand::Quit) => break,
            Ok(command) => match commands::execute(&state, command).await {
                Ok(output) => println!("{}", output),
                Err(e) => println!("Error: {}", e),
            },
            Err(e) => println!("{} (type help for the command list)", e),
        }
        prompt();
    }

    info!("Shutting down.");
    shutdown.cancel();
    state.fleet.context().supervisor.forget_all();
    if let Err(e) = monitor.await {
        error!("Battery monitor ended abnormally: {}", e);
    }
    Ok(())
}
