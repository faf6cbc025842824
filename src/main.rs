use std::path::PathBuf;

use color_eyre::eyre::{eyre, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudlink::config::{LinkConfig, DEFAULT_CONFIG_FILE};
use cloudlink::{Collaborators, LinkHandle};

/// Demo agent: runs the cloud link against no-op collaborators so the
/// subsystem can be exercised end to end.
#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = LinkConfig::load(&config_path)
        .map_err(|e| eyre!("cannot load configuration: {e}"))?;

    let link = LinkHandle::spawn(config, Collaborators::noop())
        .map_err(|e| eyre!("cannot start the cloud link: {e}"))?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting the link down");
    link.shutdown().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
