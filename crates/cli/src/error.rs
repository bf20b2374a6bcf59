//! CLI error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed operator input
    #[error("Invalid input: {0}")]
    Input(String),
    /// The backend rejected the request
    #[error("Backend error ({status}): {body}")]
    Backend { status: u16, body: String },
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Input(err.to_string())
    }
}
