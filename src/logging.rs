// src/logging.rs

//! Global logger setup.

use chrono::Local;
use fern::Dispatch;
use std::path::Path;

use crate::config::model::LoggingConfig;

/// Errors from [`setup_logging`].
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Init(#[from] fern::InitError),
}

/// Configure global logging as requested in `[logging]`. Records go to
/// stderr, and to `file` (relative to `base_dir`) when logging is enabled.
/// stdout is left alone since it carries the event stream.
pub fn setup_logging(base_dir: &Path, cfg: &LoggingConfig) -> Result<(), LoggingError> {
    let level = cfg.level_filter()?;

    let log_path = cfg
        .enable
        .then(|| base_dir.join(cfg.file.as_deref().unwrap_or("ktrace.log")));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                msg
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path).map_err(fern::InitError::from)?);
    }

    dispatch.apply().map_err(fern::InitError::from)?;
    Ok(())
}
