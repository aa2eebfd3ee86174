//! The `tickstream` server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tickstream_config::{CliArgs, Config};
use tickstream_net::{ServerConfig, StreamServer, StreamSettings};
use tickstream_server::{PlatformError, load_config};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("cannot resolve listen address {0}")]
    Address(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn server_config(config: &Config, bind_addr: SocketAddr) -> ServerConfig {
    ServerConfig {
        bind_addr,
        idle_deadline: config.session.idle_deadline(),
        stream: StreamSettings {
            tick: config.session.tick(),
            io_deadline: config.session.io_deadline(),
        },
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, StartupError> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| StartupError::Address(address.to_string()))
}

async fn run(args: CliArgs) -> Result<(), StartupError> {
    let (mut config, dirs) = load_config(args.config.as_deref())?;
    config.apply_cli_overrides(&args);

    tickstream_log::init_logging(
        Some(dirs.log_dir.as_path()),
        cfg!(debug_assertions),
        Some(&config),
    );
    tracing::info!("Using config directory {}", dirs.config_dir.display());

    let bind_addr = resolve(&config.server.listen_address()).await?;
    let server = Arc::new(StreamServer::new(server_config(&config, bind_addr)));
    tracing::info!(
        "Sessions idle out after {:?}; one value every {:?}",
        config.session.idle_deadline(),
        config.session.tick()
    );

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => tracing::error!("Cannot listen for Ctrl-C: {e}"),
        }
    });

    server.run().await?;
    tracing::info!(
        "Stopped with {} connection(s) still closing",
        server.active_connections()
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        eprintln!("tickstream: {e}");
        std::process::exit(1);
    }
}
