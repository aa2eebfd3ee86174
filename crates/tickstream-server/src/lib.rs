//! Startup plumbing shared by the `tickstream` and `tickstream-client`
//! binaries.

pub mod platform;

pub use platform::{PlatformDirs, PlatformError, load_config};
