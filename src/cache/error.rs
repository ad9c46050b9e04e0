use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failure of a cached query.
///
/// Cloneable because every caller joined to the same fill receives it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("producer failed: {0}")]
    Producer(Arc<dyn StdError + Send + Sync>),
    #[error("producer timed out after {0:?}")]
    ProducerTimeout(Duration),
    #[error("producer aborted: {0}")]
    ProducerAborted(String),
    #[error("produced value could not be serialized: {0}")]
    Encode(Arc<serde_json::Error>),
    #[error("cached value could not be deserialized: {0}")]
    Decode(Arc<serde_json::Error>),
}

impl CacheError {
    pub fn producer(err: impl Into<BoxError>) -> Self {
        Self::Producer(Arc::from(err.into()))
    }

    /// The producer's own error, when that is what failed.
    pub fn producer_source(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Producer(source) => Some(source.as_ref()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ProducerTimeout(_))
    }
}
