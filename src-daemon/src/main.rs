mod commands;
mod state;

use anyhow::Context;
use commands::Command;
use mailtide_config::ConfigManager;
use state::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = Command::parse(std::env::args().skip(1))?;

    let config_manager = ConfigManager::new().context("initialize config manager")?;
    let config = config_manager.load().context("load app config")?;
    init_tracing(&config.logging.filter);

    let state = AppState::initialize(&config_manager, config)
        .await
        .context("initialize mailtide state")?;

    commands::run(&state, command).await
}
