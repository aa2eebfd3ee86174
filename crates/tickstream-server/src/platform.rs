//! Directory resolution and config loading.
//!
//! Both binaries keep `config.ron` under the OS configuration directory
//! (`~/.config/tickstream` on Linux) unless `--config` points elsewhere.
//! Debug-build JSON logs go to a `logs` directory next to it.

use std::path::{Path, PathBuf};

use tickstream_config::{Config, ConfigError};

const APP_NAME: &str = "tickstream";

/// Errors that can occur while preparing the process environment.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The OS did not provide a configuration directory.
    #[error("could not determine OS configuration directory")]
    NoConfigDir,

    /// Loading or creating `config.ron` failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Where the service keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDirs {
    /// Holds `config.ron`.
    pub config_dir: PathBuf,
    /// Debug-build JSON logs.
    pub log_dir: PathBuf,
}

impl PlatformDirs {
    /// Resolve the directories, honouring an explicit config directory.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NoConfigDir`] if no override is given and the
    /// OS does not expose a configuration directory.
    pub fn resolve(config_override: Option<&Path>) -> Result<Self, PlatformError> {
        match config_override {
            Some(dir) => Ok(Self::resolve_with_root(dir)),
            None => {
                let base = dirs::config_dir().ok_or(PlatformError::NoConfigDir)?;
                Ok(Self::resolve_with_root(&base.join(APP_NAME)))
            }
        }
    }

    /// Directories rooted under `root`.
    pub fn resolve_with_root(root: &Path) -> Self {
        Self {
            config_dir: root.to_path_buf(),
            log_dir: root.join("logs"),
        }
    }
}

/// Resolve directories and load (or create) `config.ron`.
pub fn load_config(config_override: Option<&Path>) -> Result<(Config, PlatformDirs), PlatformError> {
    let dirs = PlatformDirs::resolve(config_override)?;
    let config = Config::load_or_create(&dirs.config_dir)?;
    Ok((config, dirs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_is_used_verbatim() {
        let dirs = PlatformDirs::resolve(Some(Path::new("/tmp/ts"))).unwrap();
        assert_eq!(dirs.config_dir, PathBuf::from("/tmp/ts"));
        assert_eq!(dirs.log_dir, PathBuf::from("/tmp/ts/logs"));
    }

    #[test]
    fn test_load_config_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, dirs) = load_config(Some(tmp.path())).unwrap();
        assert_eq!(config, Config::default());
        assert!(dirs.config_dir.join("config.ron").exists());
    }

    #[test]
    fn test_load_config_reads_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.port = 9999;
        config.save(tmp.path()).unwrap();

        let (loaded, _) = load_config(Some(tmp.path())).unwrap();
        assert_eq!(loaded.server.port, 9999);
    }
}
