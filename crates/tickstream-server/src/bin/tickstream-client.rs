//! Command-line client: requests one stream, resumes it across dropped
//! connections, and reports the result.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use tickstream_config::ClientSettings;
use tickstream_net::header::{ID_LEN, MAX_LENGTH};
use tickstream_net::{ClientError, ReconnectConfig, SessionId, run_stateful, run_stateless};
use tickstream_server::{PlatformError, load_config};

/// tickstream client command-line arguments.
///
/// Unset options fall back to the `client` section of `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tickstream-client", about = "Resuming client for a tickstream server")]
#[command(group(ArgGroup::new("mode").required(true).args(["stateful", "stateless"])))]
struct ClientArgs {
    /// Request a session-backed stream finished by a checksum.
    #[arg(long)]
    stateful: bool,

    /// Request a doubling stream with no server-side state.
    #[arg(long)]
    stateless: bool,

    /// Number of values to request.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_LENGTH)))]
    length: Option<u32>,

    /// Session identifier for stateful mode (a fresh UUID if omitted).
    #[arg(long)]
    id: Option<String>,

    /// Server host.
    #[arg(long)]
    host: Option<String>,

    /// Server port.
    #[arg(long)]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("session id must be exactly 36 printable ASCII characters")]
    InvalidId,

    #[error("cannot resolve server address {0}")]
    Address(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn reconnect_config(settings: &ClientSettings) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: settings.initial_backoff(),
        max_delay: settings.max_backoff(),
        max_retries: settings.max_retries,
        ..Default::default()
    }
}

fn session_id(requested: Option<String>) -> Result<SessionId, CliError> {
    let id = requested.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if id.len() != ID_LEN || !id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(CliError::InvalidId);
    }
    Ok(SessionId::new(id))
}

async fn run(args: ClientArgs) -> Result<(), CliError> {
    let (mut config, dirs) = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.client.server_address = host;
    }
    if let Some(port) = args.port {
        config.client.server_port = port;
    }
    if let Some(level) = args.log_level {
        config.debug.log_level = level;
    }
    tickstream_log::init_logging(
        Some(dirs.log_dir.as_path()),
        cfg!(debug_assertions),
        Some(&config),
    );

    let endpoint = config.client.server_endpoint();
    let addr: SocketAddr = tokio::net::lookup_host(&endpoint)
        .await?
        .next()
        .ok_or_else(|| CliError::Address(endpoint.clone()))?;
    let length = args
        .length
        .unwrap_or_else(|| u32::from(config.client.sequence_length));
    let reconnect = reconnect_config(&config.client);

    if args.stateful {
        let id = session_id(args.id)?;
        tracing::info!("Requesting {length} values from {addr} as {id}");
        let run = run_stateful(addr, id, length, reconnect).await?;
        for value in &run.values {
            println!("{value}");
        }
        println!(
            "received {} values after {} reconnect(s); checksum {}",
            run.values.len(),
            run.reconnects,
            run.server_checksum
        );
        run.verify()?;
        println!("checksum verified");
    } else {
        tracing::info!("Requesting {length} doubling values from {addr}");
        let run = run_stateless(addr, length, reconnect).await?;
        for value in &run.values {
            println!("{value}");
        }
        println!(
            "received {} values after {} reconnect(s); sum {}",
            run.values.len(),
            run.reconnects,
            run.sum
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    if let Err(e) = run(args).await {
        eprintln!("tickstream-client: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_is_required() {
        assert!(ClientArgs::try_parse_from(["tickstream-client"]).is_err());
        assert!(
            ClientArgs::try_parse_from(["tickstream-client", "--stateful", "--stateless"]).is_err()
        );
    }

    #[test]
    fn test_length_range_enforced() {
        assert!(ClientArgs::try_parse_from(["tickstream-client", "--stateless", "--length", "0"])
            .is_err());
        assert!(
            ClientArgs::try_parse_from(["tickstream-client", "--stateless", "--length", "65536"])
                .is_err()
        );
        let args =
            ClientArgs::try_parse_from(["tickstream-client", "--stateful", "--length", "65535"])
                .unwrap();
        assert_eq!(args.length, Some(65535));
    }

    #[test]
    fn test_generated_id_is_valid() {
        let id = session_id(None).unwrap();
        assert_eq!(id.as_str().len(), ID_LEN);
    }

    #[test]
    fn test_bad_id_rejected() {
        assert!(matches!(
            session_id(Some("short".to_string())),
            Err(CliError::InvalidId)
        ));
    }

    #[test]
    fn test_reconnect_config_from_settings() {
        let settings = ClientSettings::default();
        let reconnect = reconnect_config(&settings);
        assert_eq!(reconnect.max_retries, 10);
        assert_eq!(reconnect.initial_delay, std::time::Duration::from_secs(1));
        assert_eq!(reconnect.max_delay, std::time::Duration::from_secs(60));
    }
}
