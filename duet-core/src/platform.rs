//! Per-user application directories.

use std::path::PathBuf;

use crate::constants::APP_NAME;
use crate::error::{DuetError, DuetResult};

/// Resolves where Duet keeps its files on the current OS.
pub struct Platform;

impl Platform {
    /// Data directory for sealed keys and logs
    /// (`~/.local/share/Duet`, `~/Library/Application Support/Duet`, `%APPDATA%\Duet`).
    pub fn data_dir() -> DuetResult<PathBuf> {
        app_subdir(dirs::data_dir(), "data")
    }

    /// Directory holding `config.toml`.
    pub fn config_dir() -> DuetResult<PathBuf> {
        app_subdir(dirs::config_dir(), "config")
    }
}

fn app_subdir(base: Option<PathBuf>, kind: &str) -> DuetResult<PathBuf> {
    base.map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| DuetError::Config(format!("no {kind} directory on this platform")))
}
