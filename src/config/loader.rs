// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the agent's TOML file, deserializes it into `RawConfig` and
//! converts that into the runtime `Config`.

use log::Level;
use std::{fs, path::Path};

use crate::config::model::{Config, ConfigError, RawConfig};
use crate::ktrace_log;

/// Load and validate the configuration at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    ktrace_log!(Level::Debug, "config", "reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = from_str(&txt)?;
    ktrace_log!(Level::Info, "config", "loaded config from {:?}", path);
    Ok(cfg)
}

/// Like [`load`], but falls back to defaults when the file does not exist.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    match load(path) {
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            ktrace_log!(Level::Info, "config", "{:?} not found, using defaults", path);
            Ok(Config::default())
        }
        other => other,
    }
}

/// Parse and validate configuration text.
pub fn from_str(txt: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(txt)?;
    Config::try_from(raw)
}
