use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Snapshot API error: {0}")]
    Api(#[from] ApiError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
