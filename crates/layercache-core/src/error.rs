use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayercacheError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LayercacheError {
    /// Short, stable error code for machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            LayercacheError::Config(_) => "CONFIG_ERROR",
            LayercacheError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

pub type Result<T> = std::result::Result<T, LayercacheError>;
