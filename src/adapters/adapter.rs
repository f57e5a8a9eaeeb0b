use futures::future::BoxFuture;

use crate::error::{AdapterError, LoadError};
use crate::status::LoadStatus;

/// Future resolving one load attempt.
pub type LoadFuture = BoxFuture<'static, Result<(), AdapterError>>;

/// Capability an object implements to take part in a [`LoadLifecycle`](crate::lifecycle::LoadLifecycle).
///
/// The lifecycle keeps only a weak reference to the adapter. Whoever created both owns the
/// adapter and decides how long it lives; once it is dropped the lifecycle treats it as absent.
///
/// All hooks are called from the lifecycle's driver task, one at a time.
pub trait LoadableAdapter: Send + Sync + 'static {
    /// Begin the asynchronous work of one load attempt.
    ///
    /// Work done before returning happens immediately, the returned future is then awaited on
    /// its own task. When `retrying` is true a previous attempt may still be running: the
    /// adapter must discard it before starting over. The lifecycle ignores the outcome of
    /// superseded attempts, but any side effect they have is the adapter's concern.
    fn start_loading(&self, retrying: bool) -> LoadFuture;

    /// Interrupt the in-flight attempt.
    ///
    /// Return `true` to have the lifecycle fail the attempt with [`LoadError::Cancelled`].
    /// Return `false` if the adapter resolves the attempt's future itself.
    fn cancel_loading(&self) -> bool;

    fn on_status_changed(&self, _status: LoadStatus) {}

    fn on_error_changed(&self, _error: Option<&LoadError>) {}
}
