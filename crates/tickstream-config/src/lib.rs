//! Configuration system for the tickstream service.
//!
//! Process-wide settings (listening address, session idle deadline, tick
//! cadence, client retry policy) persist to disk as RON files. Supports CLI
//! overrides via clap, reload detection, and forward/backward compatible
//! serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{ClientSettings, Config, DebugConfig, ServerSettings, SessionSettings};
pub use error::ConfigError;
