//! CLI error type.

use filexfer::{ConfigError, TransferError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("invalid argument: {0}")]
    Usage(String),

    #[error("interrupted")]
    Interrupted,
}

impl CliError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
