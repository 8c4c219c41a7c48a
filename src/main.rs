use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use epg_viewer::{config::Config, web::{AppState, WebServer}};

#[derive(Parser)]
#[command(name = "epg-viewer")]
#[command(version)]
#[command(about = "XMLTV EPG ingest, merge and export service for IPTV playlists")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory (overrides config file)
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("epg_viewer={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting epg-viewer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;

    // PORT env for container deployments, CLI flags on top
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse() {
            config.web.port = port;
        }
    }
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    info!("Data directory: {}", config.storage.data_dir.display());

    let state = AppState::from_config(config)?;
    let server = WebServer::new(state)?;
    info!("Starting web server on {}", server.addr());
    server.serve().await?;

    Ok(())
}
