#![cfg_attr(docsrs, feature(doc_auto_cfg))]
//! Asynchronous load lifecycle driven through an adapter.
//!
//! A [`LoadLifecycle`](lifecycle::LoadLifecycle) owns the load status of a deferred resource
//! and handles loading, retrying and cancelling it. The work itself is done by a
//! [`LoadableAdapter`](adapters::adapter::LoadableAdapter), which is also notified of every
//! status and error change. This lets any type take part in the lifecycle without owning it.

mod trace;

/// Adapters supplying the asynchronous work of a lifecycle.
/// Public traits are included to allow easy use of custom implementations.
pub mod adapters;
/// Error types
pub mod error;
/// Load lifecycle state machine
pub mod lifecycle;
/// Load status and snapshots
pub mod status;

pub use adapters::adapter::{LoadFuture, LoadableAdapter};
pub use error::{AdapterError, AttachError, BoxError, LoadError};
pub use lifecycle::{LoadHandle, LoadLifecycle};
pub use status::{LoadSnapshot, LoadStatus};
