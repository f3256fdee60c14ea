use thiserror::Error;

use crate::inject::InjectError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value '{value}' for property '{key}': {reason}")]
    InvalidProperty {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read properties file {path}: {source}")]
    ReadConfig {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Output {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrumentation failed: {0}")]
    Inject(#[from] InjectError),

    #[error("Failed to spawn printer thread: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Error::InvalidProperty {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that only abort tracing setup and leave the host alone.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::InvalidProperty { .. } | Error::ReadConfig { .. }
        )
    }
}
