use clap::Parser;
use std::sync::Arc;
use tracing::info;

use streamctl::config::AppConfig;
use streamctl::registry::Registry;
use streamctl::state::AppState;
use streamctl::{supervisor, web};

/// streamctl - ffmpeg relay supervisor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "streamctl.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!(
        "streamctl initialized. State dir: {}, ffmpeg: {}",
        config.server.base_dir.display(),
        config.server.ffmpeg_binary.display()
    );

    // Opening the registry also rediscovers children from a previous run.
    let registry = Registry::open(&config.server.base_dir, &config.server.ffmpeg_binary)?;
    let state = Arc::new(AppState { config: config.clone(), registry });

    let supervisor_interval = config.server.supervisor_interval_ms;
    tokio::spawn(supervisor::start_supervisor(
        state.clone(),
        supervisor_interval,
    ));

    let app = web::router(state);

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
