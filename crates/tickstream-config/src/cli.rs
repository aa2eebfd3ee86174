//! Command-line argument parsing for the tickstream server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// tickstream server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tickstream", about = "Resumable deterministic sequence server")]
pub struct CliArgs {
    /// Port to listen on (positional shorthand for `--port`).
    #[arg(value_name = "PORT")]
    pub port_positional: Option<u16>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Session idle deadline in seconds.
    #[arg(long)]
    pub idle_deadline_secs: Option<u64>,

    /// Delay between streamed values in milliseconds.
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        // `--port` beats the positional form when both are given.
        if let Some(port) = args.port.or(args.port_positional) {
            self.server.port = port;
        }
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(secs) = args.idle_deadline_secs {
            self.session.idle_deadline_ms = secs.saturating_mul(1_000);
        }
        if let Some(tick) = args.tick_ms {
            self.session.tick_ms = tick;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
