use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use feedbot::commands::Commands;
use feedbot::config::{self, Config};
use feedbot::feed::Fetcher;
use feedbot::monitor::Monitor;
use feedbot::shutdown;
use feedbot::storage::Store;
use feedbot::telegram::{run_updates, TelegramClient};

#[derive(Parser, Debug)]
#[command(
    name = "feedbot",
    version,
    about = "Telegram bot that delivers new RSS/Atom items to subscribers"
)]
struct Args {
    /// Optional TOML config file (db_path, check_interval, allowed_chat_ids)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the JSON subscription store [default: db.json]
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Time between feed checks, e.g. 1h, 30m, 90s [default: 1h]
    #[arg(long, value_name = "DURATION", value_parser = config::parse_interval)]
    check_interval: Option<Duration>,

    /// Comma-separated chat IDs allowed to use the bot; empty allows all
    #[arg(
        long,
        value_name = "IDS",
        value_delimiter = ',',
        allow_negative_numbers = true
    )]
    allowed_chats: Option<Vec<i64>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config file '{}'", path.display()))?,
        None => Config::default(),
    };
    let config = file_config.with_overrides(args.db, args.check_interval, args.allowed_chats);
    config.validate()?;
    let api_key = config::api_key_from_env()?;

    tracing::info!(
        db = %config.db_path.display(),
        check_interval = ?config.check_interval,
        "Starting feed bot"
    );
    if config.allowed_chat_ids.is_empty() {
        tracing::info!("No chat restrictions (allow list is empty)");
    } else {
        tracing::info!(allowed = ?config.allowed_chat_ids, "Restricting bot to allowed chats");
    }

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("Failed to open store '{}'", config.db_path.display()))?;
    let fetcher = Fetcher::new().context("Failed to build HTTP client")?;
    let telegram = TelegramClient::new(api_key).context("Failed to build Telegram client")?;

    let (trigger, shutdown) = shutdown::channel();

    let monitor = Monitor::new(store.clone(), fetcher.clone(), telegram.clone())
        .with_interval(config.check_interval);
    let monitor_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                trigger.trigger();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let commands = Arc::new(
        Commands::new(store, fetcher, telegram.clone(), shutdown.clone())
            .with_allowed_chats(config.allowed_chat_ids.clone()),
    );
    run_updates(&telegram, commands, shutdown).await;

    monitor_task.await.context("Feed monitor task failed")?;
    tracing::info!("Bot stopped gracefully");
    Ok(())
}
