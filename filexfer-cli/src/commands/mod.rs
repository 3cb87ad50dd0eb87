//! CLI subcommands.

pub mod bitmask;
pub mod config;
pub mod copy;

use std::path::Path;

use filexfer::TransferConfig;

use crate::error::CliError;

/// Defaults, overridden by the INI file when one is given.
pub fn load_config(path: Option<&Path>) -> Result<TransferConfig, CliError> {
    match path {
        Some(path) => Ok(TransferConfig::from_ini_file(path)?),
        None => Ok(TransferConfig::default()),
    }
}
