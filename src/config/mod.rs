//! Configuration management for SleepPreventer
//!
//! - **store**: generic key → integer file store
//! - **settings**: the three power flags mapped onto store keys

pub mod settings;
pub mod store;

pub use store::ConfigStore;

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::constants::config::EXTENSION;

/// Config file beside the executable, same base name, `.cfg` extension
pub fn default_config_path() -> Result<PathBuf> {
    let exe_path = std::env::current_exe().context("Failed to resolve executable path")?;
    Ok(exe_path.with_extension(EXTENSION))
}
