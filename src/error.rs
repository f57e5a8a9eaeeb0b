use std::error::Error;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// Boxed error type adapters report failures with.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Error observed through [`LoadLifecycle`](crate::lifecycle::LoadLifecycle) state and completions.
///
/// Cloning is cheap: adapter errors are shared, so the same failure can be handed to every
/// pending completion and to the published snapshot.
#[derive(Debug, Clone, ThisError)]
pub enum LoadError {
    /// `load` or `retry_load` was called while no live adapter was attached.
    #[error("no loadable adapter is attached")]
    NoAdapter,

    /// Load was cancelled and the adapter asked the lifecycle to report it.
    #[error("load was cancelled")]
    Cancelled,

    /// Adapter failed without describing why.
    #[error("load failed for an unknown reason")]
    Unknown,

    /// Failure reported by the adapter, passed through unchanged.
    #[error(transparent)]
    Adapter(Arc<dyn Error + Send + Sync + 'static>),

    /// Lifecycle driver stopped before the load finished.
    #[error("load lifecycle was shut down")]
    Closed,
}

impl LoadError {
    /// Adapter error carried by this value, if any.
    pub fn adapter_error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            LoadError::Adapter(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

/// Failure returned by [`LoadableAdapter::start_loading`](crate::adapters::adapter::LoadableAdapter::start_loading).
///
/// `source` may be empty when the adapter has nothing descriptive to report;
/// the lifecycle then records [`LoadError::Unknown`].
#[derive(Debug)]
pub struct AdapterError {
    source: Option<BoxError>,
}

impl AdapterError {
    pub fn new<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        AdapterError {
            source: Some(source.into()),
        }
    }

    /// Failure with no attached description.
    pub fn unspecified() -> Self {
        AdapterError { source: None }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(source) => write!(f, "adapter error: {source}"),
            None => write!(f, "adapter error"),
        }
    }
}

impl Error for AdapterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(source) => Some(source.as_ref()),
            None => None,
        }
    }
}

impl From<BoxError> for AdapterError {
    fn from(value: BoxError) -> Self {
        AdapterError { source: Some(value) }
    }
}

impl From<AdapterError> for LoadError {
    fn from(value: AdapterError) -> Self {
        match value.source {
            Some(source) => LoadError::Adapter(Arc::from(source)),
            None => LoadError::Unknown,
        }
    }
}

/// Error returned when wiring an adapter to a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum AttachError {
    #[error("an adapter is already attached to this lifecycle")]
    AlreadyAttached,
}
