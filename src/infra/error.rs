use thiserror::Error;

use crate::cache::{StoreError, SynthesizerError};

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("upstream client error: {message}")]
    Upstream { message: String },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }
}

impl From<SynthesizerError> for InfraError {
    fn from(err: SynthesizerError) -> Self {
        Self::configuration(err.to_string())
    }
}
