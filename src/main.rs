// src/main.rs - feeder-host entry point
use chrono::Local;
use clap::Parser;
use tokio::sync::broadcast;
use tokio::task::LocalSet;

use feeder_rs::config::{self, Config, ConfigError, home_file_path};
use feeder_rs::feeder::Feeder;
use feeder_rs::web::api::{AppState, create_router};

#[derive(Parser, Debug)]
#[command(name = "feeder-host", about = "Canned-food dispenser controller")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "feeder.toml")]
    config: String,
    /// Override the serial port from the config
    #[arg(long)]
    port: Option<String>,
    /// Override the baud rate from the config
    #[arg(long)]
    baud: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    tracing::info!("Starting canned-food dispenser host");

    let cli = Cli::parse();

    let mut config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No config at '{}', using built-in defaults", cli.config);
            Config::default()
        }
        Err(e) => {
            tracing::error!("Failed to load config from '{}': {}", cli.config, e);
            return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>);
        }
    };
    if let Some(port) = cli.port {
        config.link.port = port;
    }
    if let Some(baud) = cli.baud {
        config.link.baud = baud;
    }

    tracing::info!("Motion controller: {} @ {} baud", config.link.port, config.link.baud);
    tracing::info!("Snapshot file: {}", home_file_path(&config.paths.state_file).display());

    // The link is the one thing we cannot run without.
    let mut feeder = Feeder::new(config.clone()).map_err(|e| {
        tracing::error!("Failed to initialize feeder: {}", e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;
    feeder.startup(Local::now()).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let local = LocalSet::new();

    if config.web.enabled {
        let app_state = AppState {
            status: feeder.status_handle(),
            command_path: home_file_path(&config.paths.command_file),
            state_path: home_file_path(&config.paths.state_file),
        };
        let app = create_router(app_state);
        let listener = tokio::net::TcpListener::bind(&config.web.bind).await?;
        tracing::info!("Web API listening on http://{}", listener.local_addr()?);
        let mut shutdown_rx = shutdown_tx.subscribe();
        local.spawn_local(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });
            if let Err(e) = serve.await {
                tracing::error!("Web server error: {}", e);
            }
        });
    }

    let run_rx = shutdown_tx.subscribe();
    local.spawn_local(async move {
        if let Err(e) = feeder.run(run_rx).await {
            tracing::error!("Feeder stopped with error: {}", e);
        }
    });
    local.await;

    Ok(())
}
